//! FUSE mount of the secret filesystem
//!
//! # Architecture
//!
//! - [`Session`]: `fuser::Filesystem` implementation; every request is
//!   dispatched onto the tokio runtime and answered by [`SecretFs`]
//! - [`InodeTable`]: bidirectional inode ↔ path mapping
//!
//! [`SecretFs`]: crate::fs::SecretFs

mod inode_table;
mod session;

pub use inode_table::InodeTable;
pub use session::{mount, Session};
