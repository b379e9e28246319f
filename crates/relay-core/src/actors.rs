// Actors
// Single agents and teams by composition; delegation stays inside membership

use serde::{Deserialize, Serialize};

/// A single LLM-backed agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    /// Persona / standing instructions, prepended to every turn prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Default model identifier passed through to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Registry tools this agent may use; `None` means all registered tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: None,
            model: None,
            tools: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn can_use_tool(&self, name: &str) -> bool {
        match &self.tools {
            Some(allowed) => allowed.iter().any(|t| t == name),
            None => true,
        }
    }
}

/// A group of actors that hand turns to each other by delegation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub members: Vec<Actor>,
    /// Member who takes the team's first turn; defaults to the first member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl Team {
    pub fn new(name: impl Into<String>, members: Vec<Actor>) -> Self {
        Self {
            name: name.into(),
            members,
            entry: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }
}

/// An entity capable of taking a turn. Composition over inheritance: a team
/// holds actors, which may themselves be teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Actor {
    Agent(AgentProfile),
    Team(Team),
}

impl Actor {
    pub fn name(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.name,
            Self::Team(team) => &team.name,
        }
    }

    /// Whether `name` is this actor or any (transitive) member.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::Agent(agent) => agent.name == name,
            Self::Team(team) => {
                team.name == name || team.members.iter().any(|m| m.contains(name))
            }
        }
    }

    /// Find the agent profile behind `name`, descending through teams.
    pub fn resolve_agent(&self, name: &str) -> Option<&AgentProfile> {
        match self {
            Self::Agent(agent) => (agent.name == name).then_some(agent),
            Self::Team(team) => {
                if team.name == name {
                    return self.entry_agent();
                }
                team.members.iter().find_map(|m| m.resolve_agent(name))
            }
        }
    }

    /// The agent who acts when this actor is addressed directly: itself for
    /// an agent, the entry member (or first member) for a team.
    pub fn entry_agent(&self) -> Option<&AgentProfile> {
        match self {
            Self::Agent(agent) => Some(agent),
            Self::Team(team) => match &team.entry {
                Some(entry) => team.members.iter().find_map(|m| m.resolve_agent(entry)),
                None => team.members.first().and_then(|m| m.entry_agent()),
            },
        }
    }

    /// Flattened names of all agent members, for delegation tool schemas.
    pub fn agent_names(&self) -> Vec<String> {
        match self {
            Self::Agent(agent) => vec![agent.name.clone()],
            Self::Team(team) => team.members.iter().flat_map(|m| m.agent_names()).collect(),
        }
    }
}

/// The set of actors known to one orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Roster {
    pub actors: Vec<Actor>,
}

impl Roster {
    pub fn new(actors: Vec<Actor>) -> Self {
        Self { actors }
    }

    pub fn resolve_agent(&self, name: &str) -> Option<&AgentProfile> {
        self.actors.iter().find_map(|a| a.resolve_agent(name))
    }

    /// Whether `from` may hand the next turn to `to`: some team containing
    /// `from` must also contain `to`.
    pub fn delegation_allowed(&self, from: &str, to: &str) -> bool {
        self.teams_containing(from)
            .iter()
            .any(|team| team.members.iter().any(|m| m.contains(to)))
    }

    /// Agents `from` may delegate to: members of every team containing
    /// `from`, excluding `from` itself.
    pub fn delegate_targets(&self, from: &str) -> Vec<String> {
        let mut targets = Vec::new();
        for team in self.teams_containing(from) {
            for member in &team.members {
                for name in member.agent_names() {
                    if name != from && !targets.contains(&name) {
                        targets.push(name);
                    }
                }
            }
        }
        targets
    }

    fn teams_containing(&self, name: &str) -> Vec<&Team> {
        let mut found = Vec::new();
        for actor in &self.actors {
            collect_teams_containing(actor, name, &mut found);
        }
        found
    }
}

fn collect_teams_containing<'a>(actor: &'a Actor, name: &str, found: &mut Vec<&'a Team>) {
    if let Actor::Team(team) = actor {
        if team.members.iter().any(|m| m.contains(name)) {
            found.push(team);
        }
        for member in &team.members {
            collect_teams_containing(member, name, found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_team() -> Roster {
        Roster::new(vec![Actor::Team(Team::new(
            "duo",
            vec![
                Actor::Agent(AgentProfile::new("x")),
                Actor::Agent(AgentProfile::new("y")),
            ],
        ))])
    }

    #[test]
    fn team_entry_defaults_to_first_member() {
        let roster = pair_team();
        let entry = roster.resolve_agent("duo").expect("entry");
        assert_eq!(entry.name, "x");
    }

    #[test]
    fn team_entry_override_is_honored() {
        let team = Team::new(
            "duo",
            vec![
                Actor::Agent(AgentProfile::new("x")),
                Actor::Agent(AgentProfile::new("y")),
            ],
        )
        .with_entry("y");
        let actor = Actor::Team(team);
        assert_eq!(actor.entry_agent().expect("entry").name, "y");
    }

    #[test]
    fn delegation_requires_shared_team() {
        let mut roster = pair_team();
        roster.actors.push(Actor::Agent(AgentProfile::new("outsider")));

        assert!(roster.delegation_allowed("x", "y"));
        assert!(roster.delegation_allowed("y", "x"));
        assert!(!roster.delegation_allowed("x", "outsider"));
        assert!(!roster.delegation_allowed("outsider", "x"));
    }

    #[test]
    fn nested_teams_resolve_recursively() {
        let inner = Actor::Team(Team::new(
            "reviewers",
            vec![
                Actor::Agent(AgentProfile::new("alice")),
                Actor::Agent(AgentProfile::new("bob")),
            ],
        ));
        let outer = Roster::new(vec![Actor::Team(Team::new(
            "org",
            vec![inner, Actor::Agent(AgentProfile::new("lead"))],
        ))]);

        assert_eq!(outer.resolve_agent("bob").expect("bob").name, "bob");
        assert!(outer.delegation_allowed("lead", "alice"));
        assert!(outer.delegation_allowed("alice", "bob"));
    }

    #[test]
    fn delegate_targets_exclude_self() {
        let roster = pair_team();
        assert_eq!(roster.delegate_targets("x"), vec!["y".to_string()]);
        assert_eq!(roster.delegate_targets("y"), vec!["x".to_string()]);
        assert!(roster.delegate_targets("outsider").is_empty());
    }

    #[test]
    fn tool_allowlist_gates_usage() {
        let agent = AgentProfile::new("x").with_tools(["echo"]);
        assert!(agent.can_use_tool("echo"));
        assert!(!agent.can_use_tool("shell"));
        assert!(AgentProfile::new("open").can_use_tool("anything"));
    }
}
