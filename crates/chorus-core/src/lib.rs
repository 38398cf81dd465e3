pub mod credentials;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod profile;
pub mod provider;
pub mod stream;

pub use credentials::{ApiKey, Credentials};
pub use errors::GatewayError;
pub use ids::{AgentId, ClientId, ConnectionId, SessionId, SessionKey};
pub use messages::{Message, Role};
pub use profile::{AgentProfile, AgentSummary, HistoryMode};
pub use provider::{CompletionProvider, CompletionRequest, EventStream};
pub use stream::{StreamEvent, TokenUsage};
