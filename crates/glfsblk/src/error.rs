//! Error types for the gluster block driver.

use thiserror::Error;

use crate::glfs::Errno;

/// Usage string reported with every malformed image location.
pub const GLUSTER_USAGE: &str =
    "Usage: file=gluster[+transport]://[server[:port]]/volname/image[?socket=...]";

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, GlusterError>;

/// Error variants for driver operations.
///
/// Every variant maps onto a system error number through [`GlusterError::to_errno`];
/// the block-layer facade hands that number back negated.
#[derive(Debug, Error)]
pub enum GlusterError {
    /// The image location could not be parsed.
    #[error("Invalid gluster location '{uri}': {reason}. {}", GLUSTER_USAGE)]
    InvalidUri {
        /// The rejected location string.
        uri: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The open options carried no `filename`.
    #[error("Missing 'filename' option for gluster image")]
    MissingFilename,

    /// An option had the wrong type or an unusable value.
    #[error("Invalid option '{name}': {reason}")]
    InvalidOption {
        /// Option name.
        name: String,
        /// Description of the problem.
        reason: String,
    },

    /// Unknown preallocation mode, or `full` without zero-fill support.
    #[error("Invalid preallocation mode: '{mode}' or GlusterFS doesn't support zerofill API")]
    InvalidPreallocation {
        /// The requested mode.
        mode: String,
    },

    /// The client library could not allocate a volume handle.
    #[error("Failed to allocate volume handle for '{volname}': {errno}")]
    VolumeAlloc {
        /// Volume name.
        volname: String,
        /// Underlying system error.
        errno: Errno,
    },

    /// The volfile server could not be configured.
    #[error("Failed to set volfile server {transport}:{server}:{port}: {errno}")]
    TransportSetup {
        /// Transport name.
        transport: String,
        /// Host name or socket path.
        server: String,
        /// Port, 0 for the library default.
        port: u16,
        /// Underlying system error.
        errno: Errno,
    },

    /// The client library rejected the logging destination.
    #[error("Failed to configure client logging: {errno}")]
    Logging {
        /// Underlying system error.
        errno: Errno,
    },

    /// Connecting to the volume failed.
    #[error("Gluster connection failed for server={server} port={port} volume={volume} image={image} transport={transport}: {errno}")]
    ConnectFailed {
        /// Host name or socket path.
        server: String,
        /// Port, 0 for the library default.
        port: u16,
        /// Volume name.
        volume: String,
        /// Image path inside the volume.
        image: String,
        /// Transport name.
        transport: String,
        /// Underlying system error.
        errno: Errno,
    },

    /// A synchronous file-level call failed.
    #[error("{op} failed on '{path}': {errno}")]
    File {
        /// Library call that failed.
        op: &'static str,
        /// Image path inside the volume.
        path: String,
        /// Underlying system error.
        errno: Errno,
    },

    /// An asynchronous request failed, was rejected, or moved fewer bytes than requested.
    #[error("Asynchronous {op} failed: {errno}")]
    Aio {
        /// Library call that failed.
        op: &'static str,
        /// Underlying system error.
        errno: Errno,
    },

    /// A request addressed a negative or unrepresentable sector range.
    #[error("Invalid request of {nb_sectors} sectors at sector {sector_num}")]
    InvalidRequest {
        /// First sector.
        sector_num: i64,
        /// Sector count.
        nb_sectors: i32,
    },

    /// The driver instance has no open session.
    #[error("Gluster image is not open")]
    NotOpen,
}

impl GlusterError {
    /// Returns the positive system error number for this error.
    pub fn to_errno(&self) -> i32 {
        match self {
            GlusterError::InvalidUri { .. } => libc::EINVAL,
            GlusterError::MissingFilename => libc::EINVAL,
            GlusterError::InvalidOption { .. } => libc::EINVAL,
            GlusterError::InvalidPreallocation { .. } => libc::EINVAL,
            GlusterError::VolumeAlloc { errno, .. } => errno.code(),
            GlusterError::TransportSetup { errno, .. } => errno.code(),
            GlusterError::Logging { errno } => errno.code(),
            GlusterError::ConnectFailed { errno, .. } => errno.code(),
            GlusterError::File { errno, .. } => errno.code(),
            GlusterError::Aio { errno, .. } => errno.code(),
            GlusterError::InvalidRequest { .. } => libc::EINVAL,
            GlusterError::NotOpen => libc::EBADF,
        }
    }

    /// Returns the error number in the block layer's convention (negative).
    pub fn to_negative_errno(&self) -> i32 {
        -self.to_errno()
    }

    pub(crate) fn invalid_uri(uri: &str, reason: impl Into<String>) -> Self {
        GlusterError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}
