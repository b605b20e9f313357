//! `scanflow-core` — scheduler foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod status;

pub use error::DomainError;
pub use id::{PartitionId, ScanJobId, TargetId, TenantId};
pub use status::WorkStatus;
