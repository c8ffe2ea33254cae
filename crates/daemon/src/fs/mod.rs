//! Read-only secret filesystem
//!
//! Path-based operations shared by every kernel adaptation layer:
//!
//! - [`router`] classifies a path into a [`VirtualNode`]
//! - [`attrs`] derives mode, size and ownership for a node
//! - [`SecretFs`] composes both with the secret cache and renders the
//!   control files

pub mod attrs;
mod engine;
mod error;
mod handle;
pub mod router;

pub use attrs::{Attributes, FileKind};
pub use engine::{DirEntry, SecretFs, StatFs, FS_NAME};
pub use error::FsError;
pub use handle::FileHandle;
pub use router::{ControlFile, VirtualNode};
