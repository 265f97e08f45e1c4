// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{Map, Value};
use tracing::debug;

use koi_config::{AgentSpec, LlmConfig};
use koi_memory::{ContextMemory, MemoryWindows};

/// A named capability set.  Tokens match hierarchically: holding
/// `registry` grants `registry:read` and `registry:write`.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    capabilities: BTreeSet<String>,
}

impl Role {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Role for agents without an explicit one: everything is allowed.
    pub fn unrestricted() -> Self {
        Self::new(
            "unrestricted",
            ["execute", "delegate", "registry"].map(String::from),
        )
    }

    pub fn has_capability(&self, token: &str) -> bool {
        self.capabilities.iter().any(|cap| {
            cap == token || token.starts_with(&format!("{cap}:"))
        })
    }
}

/// One member of a team: a live agent or a remote MCP address.
#[derive(Clone)]
pub enum TeamMember {
    Agent(Arc<Agent>),
    Address(String),
}

/// A named collection of members.  Constructing a team back-fills the
/// `peers` reference of every contained agent that does not have one yet.
pub struct Team {
    pub name: String,
    pub members: HashMap<String, TeamMember>,
}

impl Team {
    pub fn new(name: impl Into<String>, members: HashMap<String, TeamMember>) -> Arc<Self> {
        let team = Arc::new(Self {
            name: name.into(),
            members,
        });
        for member in team.members.values() {
            if let TeamMember::Agent(agent) = member {
                let mut peers = agent.peers.lock().unwrap();
                if peers.is_none() {
                    *peers = Some(Arc::clone(&team));
                    debug!(agent = %agent.name, team = %team.name, "peers back-filled");
                }
            }
        }
        team
    }

    /// The agent members, in stable name order.
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        let mut labelled: Vec<(&String, &TeamMember)> = self.members.iter().collect();
        labelled.sort_by_key(|(label, _)| label.clone());
        labelled
            .into_iter()
            .filter_map(|(_, m)| match m {
                TeamMember::Agent(a) => Some(Arc::clone(a)),
                TeamMember::Address(_) => None,
            })
            .collect()
    }
}

/// A named LLM-driven worker: event handlers, a role, user-defined state,
/// and a context memory that survives across CLI turns.
pub struct Agent {
    pub name: String,
    pub role: Role,
    /// Per-agent LLM override; `None` uses the runtime default.
    pub llm: Option<LlmConfig>,
    /// Event name → playbook text.
    pub handlers: HashMap<String, String>,
    pub skills: Vec<String>,
    pub uses_teams: Vec<String>,
    /// MCP server names this agent may call.
    pub mcp: Vec<String>,
    /// Mutable user-defined state blob.
    pub state: Arc<StdMutex<Map<String, Value>>>,
    /// Back-filled by the first team that contains this agent.
    pub peers: StdMutex<Option<Arc<Team>>>,
    /// Tiered transcript; exclusively owned, serialised between turns.
    pub memory: tokio::sync::Mutex<ContextMemory>,
    busy: AtomicBool,
}

impl Agent {
    pub fn from_spec(spec: AgentSpec, role: Role, windows: MemoryWindows) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name,
            role,
            llm: spec.llm,
            handlers: spec.handlers,
            skills: spec.skills,
            uses_teams: spec.uses_teams,
            mcp: spec.mcp,
            state: Arc::new(StdMutex::new(spec.state)),
            peers: StdMutex::new(None),
            memory: tokio::sync::Mutex::new(ContextMemory::new(windows)),
            busy: AtomicBool::new(false),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// The playbook for an exact event name.
    pub fn handler(&self, event: &str) -> Option<&str> {
        self.handlers.get(event).map(String::as_str)
    }

    /// Names of agents reachable through this agent's team.
    pub fn peer_names(&self) -> Vec<String> {
        match &*self.peers.lock().unwrap() {
            Some(team) => team
                .agents()
                .iter()
                .filter(|a| a.name != self.name)
                .map(|a| a.name.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> Arc<Agent> {
        Agent::from_spec(
            AgentSpec {
                name: name.to_string(),
                ..Default::default()
            },
            Role::unrestricted(),
            MemoryWindows::default(),
        )
    }

    // ── Roles ─────────────────────────────────────────────────────────────────

    #[test]
    fn exact_capability_matches() {
        let role = Role::new("worker", ["execute".to_string()]);
        assert!(role.has_capability("execute"));
        assert!(!role.has_capability("delegate"));
    }

    #[test]
    fn capability_prefix_grants_children() {
        let role = Role::new("admin", ["registry".to_string()]);
        assert!(role.has_capability("registry"));
        assert!(role.has_capability("registry:read"));
        assert!(role.has_capability("registry:write"));
    }

    #[test]
    fn child_capability_does_not_grant_parent() {
        let role = Role::new("reader", ["registry:read".to_string()]);
        assert!(role.has_capability("registry:read"));
        assert!(!role.has_capability("registry"));
        assert!(!role.has_capability("registry:write"));
    }

    #[test]
    fn prefix_match_requires_separator() {
        // "reg" must not grant "registry:read".
        let role = Role::new("odd", ["reg".to_string()]);
        assert!(!role.has_capability("registry:read"));
    }

    #[test]
    fn unrestricted_role_has_everything() {
        let role = Role::unrestricted();
        assert!(role.has_capability("execute"));
        assert!(role.has_capability("delegate"));
        assert!(role.has_capability("registry:write"));
    }

    // ── Teams ─────────────────────────────────────────────────────────────────

    #[test]
    fn team_construction_backfills_peers() {
        let a = agent("alpha");
        let b = agent("beta");
        let mut members = HashMap::new();
        members.insert("first".to_string(), TeamMember::Agent(Arc::clone(&a)));
        members.insert("second".to_string(), TeamMember::Agent(Arc::clone(&b)));
        let team = Team::new("crew", members);
        assert!(a.peers.lock().unwrap().is_some());
        assert_eq!(a.peer_names(), vec!["beta"]);
        assert_eq!(team.agents().len(), 2);
    }

    #[test]
    fn existing_peers_are_not_replaced() {
        let a = agent("alpha");
        let mut first_members = HashMap::new();
        first_members.insert("a".to_string(), TeamMember::Agent(Arc::clone(&a)));
        let first = Team::new("first-team", first_members);

        let mut second_members = HashMap::new();
        second_members.insert("a".to_string(), TeamMember::Agent(Arc::clone(&a)));
        let _second = Team::new("second-team", second_members);

        let peers = a.peers.lock().unwrap();
        assert_eq!(peers.as_ref().unwrap().name, first.name);
    }

    #[test]
    fn address_members_are_not_peer_agents() {
        let a = agent("alpha");
        let mut members = HashMap::new();
        members.insert("a".to_string(), TeamMember::Agent(Arc::clone(&a)));
        members.insert(
            "remote".to_string(),
            TeamMember::Address("mcp://tools.example.com/x".to_string()),
        );
        let team = Team::new("mixed", members);
        assert_eq!(team.agents().len(), 1);
        assert!(a.peer_names().is_empty());
    }

    // ── Agent basics ──────────────────────────────────────────────────────────

    #[test]
    fn busy_flag_round_trips() {
        let a = agent("x");
        assert!(!a.is_busy());
        a.set_busy(true);
        assert!(a.is_busy());
    }

    #[test]
    fn handler_lookup_is_exact() {
        let mut spec = AgentSpec {
            name: "h".to_string(),
            ..Default::default()
        };
        spec.handlers.insert("main".to_string(), "Do things.".to_string());
        let a = Agent::from_spec(spec, Role::unrestricted(), MemoryWindows::default());
        assert_eq!(a.handler("main"), Some("Do things."));
        assert_eq!(a.handler("other"), None);
    }
}
