use thiserror::Error;

use ethos_agent::CompileError;
use ethos_memory::PersistenceError;

/// Failures a caller of the core API can observe. Provider failures never
/// appear here: the intellect degrades to a generic answer and the will
/// fails closed.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("user '{0}' is unknown")]
    UnknownUser(String),
    #[error("conversation '{0}' is unknown or not owned by the caller")]
    UnknownConversation(String),
    #[error("agent '{0}' is unknown")]
    UnknownAgent(String),
    #[error("daily prompt limit of {0} reached")]
    QuotaExceeded(u32),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
