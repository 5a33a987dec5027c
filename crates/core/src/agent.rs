//! Audit-trail actor credited with causing an event.

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Who caused an event. Recorded for audit only; never an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "lowercase")]
pub enum Agent {
    System,
    User(UserId),
    Anonymous,
}

impl Agent {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Agent::User(id) => Some(*id),
            Agent::System | Agent::Anonymous => None,
        }
    }
}

impl core::fmt::Display for Agent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Agent::System => f.write_str("system"),
            Agent::User(id) => write!(f, "user:{id}"),
            Agent::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_round_trips_through_json() {
        for agent in [Agent::System, Agent::Anonymous, Agent::User(UserId::new())] {
            let json = serde_json::to_value(agent).unwrap();
            let back: Agent = serde_json::from_value(json).unwrap();
            assert_eq!(back, agent);
        }
    }

    #[test]
    fn only_user_agents_carry_a_user_id() {
        let user = UserId::new();
        assert_eq!(Agent::User(user).user_id(), Some(user));
        assert_eq!(Agent::System.user_id(), None);
    }
}
