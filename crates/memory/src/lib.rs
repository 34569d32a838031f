//! Persistence port for the governed-turn pipeline.
//!
//! The core never talks to a database directly. It depends on the
//! [`Persistence`] trait plus the [`SpiritTransaction`] load-and-lock
//! contract, and ships [`MemStore`] as the in-process reference backend.

pub mod mem;
pub mod schema;
pub mod store;

pub use mem::MemStore;
pub use schema::{
    AuditLookup, AuditOutcome, AuditStatus, ChatMessage, ChatRole, Conversation, NEW_CHAT_TITLE,
    SpiritMemory, UserRecord,
};
pub use store::{Persistence, PersistenceError, SpiritTransaction};
