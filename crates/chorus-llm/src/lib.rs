pub mod dashscope;
pub mod sse;

pub mod mock;

pub use dashscope::{DashScopeConfig, DashScopeProvider};
pub use mock::{MockProvider, MockResponse};
