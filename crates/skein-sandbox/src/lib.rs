//! Sandbox provisioning and allocation scheduling.
//!
//! Sessions execute tools inside remote sandbox instances. This crate
//! holds the provider API client ([`HttpSandboxApi`]) and the
//! [`SandboxScheduler`], which maps sessions to instances according to
//! the user's [`AllocationStrategy`] and keeps the allocation rows in
//! the store truthful via liveness probing and reconciliation.

pub mod api;
pub mod error;
pub mod mock;
pub mod scheduler;

pub use api::{HttpSandboxApi, Liveness, ProvisionedSandbox, SandboxApi};
pub use error::{SandboxError, SandboxResult};
pub use mock::MockSandboxApi;
pub use scheduler::{SandboxScheduler, SchedulerConfig};

pub use skein_store::AllocationStrategy;
