//! The governed-turn runtime.
//!
//! Wires the faculties, persistence port, instance cache, and background
//! audit queue into the three operations outer layers consume:
//! `process_prompt`, `audit_result`, and `invalidate_agent`.

pub mod audit;
pub mod cache;
pub mod error;
pub mod orchestrator;
pub mod service;
pub mod suggestions;
pub mod summarizer;

pub use audit::{AuditHandle, PendingAudit, TurnSnapshot, spawn_audit_worker};
pub use cache::{InstanceCache, InstanceDeps, InstanceRequest};
pub use error::TurnError;
pub use orchestrator::{
    INTELLECT_FAILURE_MESSAGE, Orchestrator, OrchestratorOptions, TurnResponse,
};
pub use service::EthosService;
