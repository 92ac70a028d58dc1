//! Client-library surface consumed by the driver.
//!
//! The GlusterFS client library is modelled as three traits so the driver can
//! run against libgfapi (see the `gfapi` feature) or the in-process
//! [`MockGlfs`](crate::mock_glfs::MockGlfs). The library owns its own worker
//! threads: every `*_async` call returns at once and later invokes its
//! [`AioCallback`] from one of those threads.

use core::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::uri::Transport;

/// A system error number reported by the client library (always positive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    /// The calling thread's current `errno`.
    pub fn last_os_error() -> Self {
        Self::from_os(io::Error::last_os_error().raw_os_error())
    }

    /// A failed call that left `errno` unset still reports an error.
    fn from_os(code: Option<i32>) -> Self {
        match code {
            Some(code) if code > 0 => Errno(code),
            _ => Errno(libc::EIO),
        }
    }

    /// Raw error number.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Error number to report; anything not positive becomes `EIO`.
    pub fn code(self) -> i32 {
        if self.0 > 0 {
            self.0
        } else {
            libc::EIO
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> Self {
        io::Error::from_raw_os_error(errno.0)
    }
}

/// `open(2)`-style flags for `open` and `creat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(i32);

impl OpenFlags {
    /// Read-only access.
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    /// Write-only access.
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    /// Read-write access.
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);
    /// Create the file if missing.
    pub const CREAT: OpenFlags = OpenFlags(libc::O_CREAT);
    /// Truncate an existing file.
    pub const TRUNC: OpenFlags = OpenFlags(libc::O_TRUNC);
    /// Bypass caches.
    pub const DIRECT: OpenFlags = OpenFlags(libc::O_DIRECT);
    /// Binary mode; only meaningful on hosts that distinguish text files.
    pub const BINARY: OpenFlags = OpenFlags(0);

    /// Raw flag bits.
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The access-mode bits (`O_RDONLY`, `O_WRONLY` or `O_RDWR`).
    pub const fn access_mode(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    /// True unless the access mode is write-only.
    pub const fn is_readable(self) -> bool {
        self.access_mode() != libc::O_WRONLY
    }

    /// True for write-only and read-write access.
    pub const fn is_writable(self) -> bool {
        self.access_mode() == libc::O_WRONLY || self.access_mode() == libc::O_RDWR
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the file.
    Set,
    /// From the current position.
    Cur,
    /// From the end of the file.
    End,
}

impl Whence {
    /// The matching `SEEK_*` constant.
    pub fn as_raw(self) -> i32 {
        match self {
            Whence::Set => libc::SEEK_SET,
            Whence::Cur => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        }
    }
}

/// The parts of `struct stat` the driver reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStat {
    /// File length in bytes.
    pub st_size: i64,
    /// Allocated space in 512-byte units.
    pub st_blocks: i64,
    /// Preferred I/O size.
    pub st_blksize: i64,
    /// File mode bits.
    pub st_mode: u32,
}

/// Client-library log levels (`GF_LOG_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlfsLogLevel {
    /// Logging disabled.
    None,
    /// System unusable.
    Emerg,
    /// Immediate action required.
    Alert,
    /// Critical conditions.
    Critical,
    /// Error conditions.
    #[default]
    Error,
    /// Warnings.
    Warning,
    /// Normal but significant.
    Notice,
    /// Informational.
    Info,
    /// Debug messages.
    Debug,
    /// Trace messages.
    Trace,
}

impl GlfsLogLevel {
    /// Numeric level passed to `glfs_set_logging`.
    pub fn as_raw(self) -> i32 {
        match self {
            GlfsLogLevel::None => 0,
            GlfsLogLevel::Emerg => 1,
            GlfsLogLevel::Alert => 2,
            GlfsLogLevel::Critical => 3,
            GlfsLogLevel::Error => 4,
            GlfsLogLevel::Warning => 5,
            GlfsLogLevel::Notice => 6,
            GlfsLogLevel::Info => 7,
            GlfsLogLevel::Debug => 8,
            GlfsLogLevel::Trace => 9,
        }
    }
}

/// Completion callback of an asynchronous request.
///
/// Invoked exactly once, on a library worker thread, with the number of bytes
/// transferred or a negative error number.
pub type AioCallback = Box<dyn FnOnce(isize) + Send + 'static>;

/// Scatter-gather list shared between the host and the library's threads.
///
/// Clones refer to the same buffers, so a request hands the library a
/// reference to the caller's vector rather than a copy. The host must not
/// touch the buffers while a request using them is in flight.
#[derive(Debug, Clone, Default)]
pub struct IoVector {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl IoVector {
    /// An empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector over existing buffers.
    pub fn from_buffers(buffers: Vec<Vec<u8>>) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(buffers)),
        }
    }

    /// Zero-filled buffers of the given lengths.
    pub fn zeroed(lengths: &[usize]) -> Self {
        Self::from_buffers(lengths.iter().map(|&len| vec![0u8; len]).collect())
    }

    /// Appends a buffer.
    pub fn push(&self, buf: Vec<u8>) {
        self.buffers.lock().push(buf);
    }

    /// Number of buffers.
    pub fn niov(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Total length in bytes.
    pub fn size(&self) -> usize {
        self.buffers.lock().iter().map(Vec::len).sum()
    }

    /// Concatenated contents.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.buffers.lock().concat()
    }

    /// Scatters `data` across the buffers from the first byte on; returns the
    /// number of bytes copied.
    pub fn copy_from(&self, data: &[u8]) -> usize {
        let mut copied = 0;
        for buf in self.buffers.lock().iter_mut() {
            if copied == data.len() {
                break;
            }
            let n = buf.len().min(data.len() - copied);
            buf[..n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
        }
        copied
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers.lock()
    }
}

/// Entry point of the client library.
pub trait GlfsClient: Send + Sync + 'static {
    /// Volume handle type.
    type Volume: GlfsVolume;

    /// Allocates an unconnected handle for `volname` (`glfs_new`).
    fn new_volume(&self, volname: &str) -> Result<Self::Volume, Errno>;
}

/// A volume handle (`glfs_t`).
pub trait GlfsVolume: Send + Sync + 'static {
    /// File handle type.
    type Fd: GlfsFd;

    /// Sets where the volume file is fetched from.
    fn set_volfile_server(&mut self, transport: Transport, host: &str, port: u16)
        -> Result<(), Errno>;

    /// Sets the library's own log destination (`-` for stderr) and level.
    fn set_logging(&mut self, logfile: &str, level: GlfsLogLevel) -> Result<(), Errno>;

    /// Connects to the volume.
    fn init(&mut self) -> Result<(), Errno>;

    /// Opens an existing file.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Self::Fd, Errno>;

    /// Creates (or opens) a file with the given mode.
    fn creat(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Self::Fd, Errno>;

    /// Disconnects and releases the handle. The handle is gone even on error.
    fn fini(self) -> Result<(), Errno>;
}

/// An open file (`glfs_fd_t`).
pub trait GlfsFd: Send + Sync + 'static {
    /// Closes the file. The handle is gone even on error.
    fn close(self) -> Result<(), Errno>;

    /// Sets the file length.
    fn ftruncate(&self, length: i64) -> Result<(), Errno>;

    /// Repositions the file offset and returns the new offset.
    fn lseek(&self, offset: i64, whence: Whence) -> Result<i64, Errno>;

    /// File status.
    fn fstat(&self) -> Result<FileStat, Errno>;

    /// Writes zeroes over a range, allocating it.
    fn zerofill(&self, offset: i64, len: i64) -> Result<(), Errno>;

    /// Vectored read at `offset` into `iov`.
    fn preadv_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno>;

    /// Vectored write of `iov` at `offset`.
    fn pwritev_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno>;

    /// Flushes the file to stable storage.
    fn fsync_async(&self, cb: AioCallback) -> Result<(), Errno>;

    /// Releases the storage backing a range.
    fn discard_async(&self, offset: i64, len: usize, cb: AioCallback) -> Result<(), Errno>;

    /// Writes zeroes over a range.
    fn zerofill_async(&self, offset: i64, len: i64, cb: AioCallback) -> Result<(), Errno>;
}
