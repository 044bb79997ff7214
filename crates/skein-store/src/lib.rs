//! Persistence layer.
//!
//! Four DAO contracts ([`SessionDao`], [`EventDao`],
//! [`SandboxAllocationDao`], [`UserConfigDao`]) with two backends: a
//! SQLite store for servers and an in-memory store for tests and
//! throwaway deployments. Callers hold the traits, never a backend.

pub mod dao;
pub mod error;
pub mod memory;
pub mod records;
pub mod sqlite;

pub use dao::{EventDao, SandboxAllocationDao, SessionDao, UserConfigDao};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use records::{
    AllocationStrategy, SandboxAllocationRecord, SessionRecord, UserConfigRecord,
};
pub use sqlite::SqliteStore;
