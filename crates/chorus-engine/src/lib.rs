pub mod agent;
pub mod catalog;
pub mod error;
pub mod registry;
pub mod session;

pub use agent::{Agent, DeltaStream, PromptAgent};
pub use catalog::{build_registry, AgentDefinition, BuiltinAgent, BUILTIN_AGENTS};
pub use error::{AgentError, RegistryError};
pub use registry::AgentRegistry;
pub use session::{SessionPolicy, SessionStore};
