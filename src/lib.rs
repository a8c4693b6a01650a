pub mod chat;
pub mod config;
pub mod llm_client;
pub mod memory;
pub mod scheduler;
pub mod storage;

pub use chat::ChatHandler;
pub use config::AgentConfig;
pub use llm_client::{CompletionRequest, CompletionResult, LlmClient, LlmError};
pub use memory::{Content, MemoryStore, Message, Role};
pub use scheduler::{AgentEvent, Scheduler};
pub use storage::{DocumentStore, StorageError};
