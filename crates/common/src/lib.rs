//! Shared types for secretfs
//!
//! - [`secret`]: the decoded secret model and the backend listing
//! - [`backend`]: the contract every secret service client implements
//! - [`name`]: mapping between secret names and directory entry names
//! - [`version`]: build information

pub mod backend;
pub mod name;
pub mod secret;
pub mod version;

pub use backend::{BackendError, MemoryBackend, SecretBackend};
pub use name::NameTable;
pub use secret::{Secret, SecretError, SecretListing, SecretSummary};
