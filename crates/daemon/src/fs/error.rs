use libc::c_int;

/// Filesystem operation failures, each mapping to one errno
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("secret temporarily unavailable: {0}")]
    Busy(String),
}

impl FsError {
    pub fn os_error(&self) -> c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::Busy(_) => libc::EAGAIN,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        std::io::Error::from_raw_os_error(err.os_error())
    }
}
