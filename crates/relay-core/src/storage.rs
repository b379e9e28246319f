// Thread persistence
// One JSON file per thread under a base directory; enough to reload and
// resume a conversation with ordering intact

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;

use relay_types::Thread;

pub struct ThreadStore {
    base: PathBuf,
}

impl ThreadStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        self.base.join(format!("{thread_id}.json"))
    }

    pub async fn save(&self, thread: &Thread) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(thread)?;
        let path = self.path_for(&thread.id);
        fs::write(&path, raw)
            .await
            .with_context(|| format!("writing thread file {}", path.display()))?;
        Ok(())
    }

    pub async fn load(&self, thread_id: &str) -> anyhow::Result<Option<Thread>> {
        let path = self.path_for(thread_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading thread file {}", path.display()))?;
        let thread = serde_json::from_str(&raw)
            .with_context(|| format!("parsing thread file {}", path.display()))?;
        Ok(Some(thread))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn delete(&self, thread_id: &str) -> anyhow::Result<bool> {
        let path = self.path_for(thread_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::Message;

    #[tokio::test]
    async fn save_load_round_trip_preserves_ordering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ThreadStore::new(dir.path()).await.expect("store");

        let mut thread = Thread::with_id("t-1");
        thread.push_user_message("one").expect("push");
        thread.append(Message::actor("a", "two")).expect("append");
        store.save(&thread).await.expect("save");

        let loaded = store.load("t-1").await.expect("load").expect("present");
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "one");
        assert_eq!(loaded.messages[1].content, "two");
        assert!(!loaded.is_locked());
    }

    #[tokio::test]
    async fn load_missing_thread_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ThreadStore::new(dir.path()).await.expect("store");
        assert!(store.load("absent").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn list_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ThreadStore::new(dir.path()).await.expect("store");
        store.save(&Thread::with_id("b")).await.expect("save");
        store.save(&Thread::with_id("a")).await.expect("save");

        assert_eq!(store.list().await.expect("list"), vec!["a", "b"]);
        assert!(store.delete("a").await.expect("delete"));
        assert!(!store.delete("a").await.expect("delete again"));
        assert_eq!(store.list().await.expect("list"), vec!["b"]);
    }
}
