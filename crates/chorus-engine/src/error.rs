use chorus_core::errors::GatewayError;
use chorus_core::ids::AgentId;

/// Failure that escapes an agent instead of being turned into reply text.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("agent '{agent}' failed to initialize: {reason}")]
    Initialization { agent: AgentId, reason: String },

    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("an agent with id '{0}' is already registered")]
    DuplicateAgent(AgentId),

    #[error("invalid agent definition '{agent}': {reason}")]
    InvalidDefinition { agent: AgentId, reason: String },

    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = RegistryError::DuplicateAgent(AgentId::from("story_master"));
        assert_eq!(
            err.to_string(),
            "an agent with id 'story_master' is already registered"
        );

        let err: AgentError = GatewayError::RateLimited { retry_after: None }.into();
        assert_eq!(err.to_string(), "gateway error: rate limited");

        let err: RegistryError = AgentError::Internal("boom".into()).into();
        assert_eq!(err.to_string(), "boom");
    }
}
