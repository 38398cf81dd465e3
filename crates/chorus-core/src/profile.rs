use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Static description of an agent. Immutable once the agent is registered.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub system_prompt: String,
}

impl AgentProfile {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
        }
    }
}

/// How much of the conversation an agent forwards to its provider.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Only the system prompt and the most recent user turn.
    #[default]
    SingleTurn,
    /// The full stored history.
    HistoryAware,
}

/// Listing view of an agent (no prompt text).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub category: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_mode_serde() {
        assert_eq!(
            serde_json::to_string(&HistoryMode::HistoryAware).unwrap(),
            r#""history_aware""#
        );
        let parsed: HistoryMode = serde_json::from_str(r#""single_turn""#).unwrap();
        assert_eq!(parsed, HistoryMode::SingleTurn);
        assert_eq!(HistoryMode::default(), HistoryMode::SingleTurn);
    }

    #[test]
    fn summary_omits_prompt() {
        let profile = AgentProfile {
            id: AgentId::from("story_master"),
            name: "Story Master".into(),
            description: "Writes stories".into(),
            category: "Writing".into(),
            system_prompt: "secret prompt".into(),
        };
        let json = serde_json::to_value(profile.summary()).unwrap();
        assert_eq!(json["id"], "story_master");
        assert_eq!(json["name"], "Story Master");
        assert_eq!(json["category"], "Writing");
        assert!(json.get("system_prompt").is_none());
    }
}
