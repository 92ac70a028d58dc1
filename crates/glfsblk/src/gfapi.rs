//! libgfapi client.
//!
//! Thin bindings over the GlusterFS client library. Failing calls report
//! through `errno`; asynchronous calls complete through
//! [`gluster_finish_trampoline`], which recovers the boxed [`AioCallback`]
//! from the opaque pointer handed to the library.

use std::ffi::{c_void, CString};
use std::mem;
use std::ptr::NonNull;

use libc::{c_char, c_int, iovec, mode_t, off_t, size_t, ssize_t};
use tracing::debug;

use crate::glfs::{
    AioCallback, Errno, FileStat, GlfsClient, GlfsFd, GlfsLogLevel, GlfsVolume, IoVector,
    OpenFlags, Whence,
};
use crate::uri::Transport;

#[allow(non_camel_case_types)]
#[repr(C)]
struct glfs_t {
    _private: [u8; 0],
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct glfs_fd_t {
    _private: [u8; 0],
}

type GlfsIoCbk = extern "C" fn(fd: *mut glfs_fd_t, ret: ssize_t, data: *mut c_void);

#[link(name = "gfapi")]
extern "C" {
    fn glfs_new(volname: *const c_char) -> *mut glfs_t;
    fn glfs_set_volfile_server(
        fs: *mut glfs_t,
        transport: *const c_char,
        host: *const c_char,
        port: c_int,
    ) -> c_int;
    fn glfs_set_logging(fs: *mut glfs_t, logfile: *const c_char, loglevel: c_int) -> c_int;
    fn glfs_init(fs: *mut glfs_t) -> c_int;
    fn glfs_fini(fs: *mut glfs_t) -> c_int;
    fn glfs_open(fs: *mut glfs_t, path: *const c_char, flags: c_int) -> *mut glfs_fd_t;
    fn glfs_creat(
        fs: *mut glfs_t,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> *mut glfs_fd_t;
    fn glfs_close(fd: *mut glfs_fd_t) -> c_int;
    fn glfs_ftruncate(fd: *mut glfs_fd_t, length: off_t) -> c_int;
    fn glfs_lseek(fd: *mut glfs_fd_t, offset: off_t, whence: c_int) -> off_t;
    fn glfs_fstat(fd: *mut glfs_fd_t, buf: *mut libc::stat) -> c_int;
    fn glfs_preadv_async(
        fd: *mut glfs_fd_t,
        iov: *const iovec,
        count: c_int,
        offset: off_t,
        flags: c_int,
        cbk: GlfsIoCbk,
        data: *mut c_void,
    ) -> c_int;
    fn glfs_pwritev_async(
        fd: *mut glfs_fd_t,
        iov: *const iovec,
        count: c_int,
        offset: off_t,
        flags: c_int,
        cbk: GlfsIoCbk,
        data: *mut c_void,
    ) -> c_int;
    fn glfs_fsync_async(fd: *mut glfs_fd_t, cbk: GlfsIoCbk, data: *mut c_void) -> c_int;
    #[cfg(feature = "discard")]
    fn glfs_discard_async(
        fd: *mut glfs_fd_t,
        offset: off_t,
        len: size_t,
        cbk: GlfsIoCbk,
        data: *mut c_void,
    ) -> c_int;
    #[cfg(feature = "zerofill")]
    fn glfs_zerofill_async(
        fd: *mut glfs_fd_t,
        offset: off_t,
        len: off_t,
        cbk: GlfsIoCbk,
        data: *mut c_void,
    ) -> c_int;
    #[cfg(feature = "zerofill")]
    fn glfs_zerofill(fd: *mut glfs_fd_t, offset: off_t, len: off_t) -> c_int;
}

fn cstring(s: &str) -> Result<CString, Errno> {
    CString::new(s).map_err(|_| Errno(libc::EINVAL))
}

fn check(ret: c_int) -> Result<(), Errno> {
    if ret < 0 {
        Err(Errno::last_os_error())
    } else {
        Ok(())
    }
}

/// State travelling through the library with one request.
struct PendingIo {
    cb: AioCallback,
    // Keeps the caller's buffers alive while the library holds `iovecs`.
    _iov: Option<IoVector>,
    iovecs: Vec<iovec>,
}

extern "C" fn gluster_finish_trampoline(_fd: *mut glfs_fd_t, ret: ssize_t, data: *mut c_void) {
    // SAFETY: `data` is the pointer `submit` leaked for exactly this request.
    let pending = unsafe { Box::from_raw(data as *mut PendingIo) };
    let PendingIo { cb, .. } = *pending;
    cb(ret as isize);
}

/// libgfapi entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct GfapiClient;

impl GfapiClient {
    /// A client backed by the system libgfapi.
    pub fn new() -> Self {
        GfapiClient
    }
}

impl GlfsClient for GfapiClient {
    type Volume = GfapiVolume;

    fn new_volume(&self, volname: &str) -> Result<GfapiVolume, Errno> {
        let name = cstring(volname)?;
        let raw = unsafe { glfs_new(name.as_ptr()) };
        NonNull::new(raw)
            .map(|raw| GfapiVolume { raw })
            .ok_or_else(Errno::last_os_error)
    }
}

/// A `glfs_t` handle.
pub struct GfapiVolume {
    raw: NonNull<glfs_t>,
}

// libgfapi handles are safe to use from any thread.
unsafe impl Send for GfapiVolume {}
unsafe impl Sync for GfapiVolume {}

impl GfapiVolume {
    fn fd(raw: *mut glfs_fd_t) -> Result<GfapiFd, Errno> {
        NonNull::new(raw)
            .map(|raw| GfapiFd { raw })
            .ok_or_else(Errno::last_os_error)
    }
}

impl GlfsVolume for GfapiVolume {
    type Fd = GfapiFd;

    fn set_volfile_server(
        &mut self,
        transport: Transport,
        host: &str,
        port: u16,
    ) -> Result<(), Errno> {
        let transport = cstring(transport.as_str())?;
        let host = cstring(host)?;
        check(unsafe {
            glfs_set_volfile_server(
                self.raw.as_ptr(),
                transport.as_ptr(),
                host.as_ptr(),
                c_int::from(port),
            )
        })
    }

    fn set_logging(&mut self, logfile: &str, level: GlfsLogLevel) -> Result<(), Errno> {
        let logfile = cstring(logfile)?;
        check(unsafe { glfs_set_logging(self.raw.as_ptr(), logfile.as_ptr(), level.as_raw()) })
    }

    fn init(&mut self) -> Result<(), Errno> {
        let ret = unsafe { glfs_init(self.raw.as_ptr()) };
        if ret != 0 {
            return Err(Errno::last_os_error());
        }
        Ok(())
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<GfapiFd, Errno> {
        let path = cstring(path)?;
        Self::fd(unsafe { glfs_open(self.raw.as_ptr(), path.as_ptr(), flags.bits()) })
    }

    fn creat(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<GfapiFd, Errno> {
        let path = cstring(path)?;
        Self::fd(unsafe {
            glfs_creat(self.raw.as_ptr(), path.as_ptr(), flags.bits(), mode as mode_t)
        })
    }

    fn fini(self) -> Result<(), Errno> {
        check(unsafe { glfs_fini(self.raw.as_ptr()) })
    }
}

/// A `glfs_fd_t` handle.
pub struct GfapiFd {
    raw: NonNull<glfs_fd_t>,
}

unsafe impl Send for GfapiFd {}
unsafe impl Sync for GfapiFd {}

impl GfapiFd {
    /// Hands one request to the library. `start` receives the iovec array
    /// and the opaque pointer for the trampoline.
    fn submit<F>(&self, iov: Option<&IoVector>, cb: AioCallback, start: F) -> Result<(), Errno>
    where
        F: FnOnce(*mut glfs_fd_t, *const iovec, c_int, *mut c_void) -> c_int,
    {
        let iovecs: Vec<iovec> = match iov {
            Some(iov) => iov
                .lock()
                .iter_mut()
                .map(|buf| iovec {
                    iov_base: buf.as_mut_ptr() as *mut c_void,
                    iov_len: buf.len(),
                })
                .collect(),
            None => Vec::new(),
        };
        let pending = Box::new(PendingIo {
            cb,
            _iov: iov.cloned(),
            iovecs,
        });
        let (iov_ptr, iov_cnt) = (pending.iovecs.as_ptr(), pending.iovecs.len() as c_int);
        let data = Box::into_raw(pending) as *mut c_void;

        let ret = start(self.raw.as_ptr(), iov_ptr, iov_cnt, data);
        if ret < 0 {
            let errno = Errno::last_os_error();
            // SAFETY: the library rejected the request and will not call back.
            drop(unsafe { Box::from_raw(data as *mut PendingIo) });
            debug!(%errno, "gfapi submission rejected");
            return Err(errno);
        }
        Ok(())
    }
}

impl GlfsFd for GfapiFd {
    fn close(self) -> Result<(), Errno> {
        check(unsafe { glfs_close(self.raw.as_ptr()) })
    }

    fn ftruncate(&self, length: i64) -> Result<(), Errno> {
        check(unsafe { glfs_ftruncate(self.raw.as_ptr(), length as off_t) })
    }

    fn lseek(&self, offset: i64, whence: Whence) -> Result<i64, Errno> {
        let ret = unsafe { glfs_lseek(self.raw.as_ptr(), offset as off_t, whence.as_raw()) };
        if ret < 0 {
            return Err(Errno::last_os_error());
        }
        Ok(ret as i64)
    }

    fn fstat(&self) -> Result<FileStat, Errno> {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        check(unsafe { glfs_fstat(self.raw.as_ptr(), &mut st) })?;
        Ok(FileStat {
            st_size: st.st_size as i64,
            st_blocks: st.st_blocks as i64,
            st_blksize: st.st_blksize as i64,
            st_mode: st.st_mode as u32,
        })
    }

    #[cfg(feature = "zerofill")]
    fn zerofill(&self, offset: i64, len: i64) -> Result<(), Errno> {
        check(unsafe { glfs_zerofill(self.raw.as_ptr(), offset as off_t, len as off_t) })
    }

    #[cfg(not(feature = "zerofill"))]
    fn zerofill(&self, _offset: i64, _len: i64) -> Result<(), Errno> {
        Err(Errno(libc::ENOTSUP))
    }

    fn preadv_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno> {
        self.submit(Some(iov), cb, |fd, iov, cnt, data| unsafe {
            glfs_preadv_async(fd, iov, cnt, offset as off_t, 0, gluster_finish_trampoline, data)
        })
    }

    fn pwritev_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno> {
        self.submit(Some(iov), cb, |fd, iov, cnt, data| unsafe {
            glfs_pwritev_async(fd, iov, cnt, offset as off_t, 0, gluster_finish_trampoline, data)
        })
    }

    fn fsync_async(&self, cb: AioCallback) -> Result<(), Errno> {
        self.submit(None, cb, |fd, _, _, data| unsafe {
            glfs_fsync_async(fd, gluster_finish_trampoline, data)
        })
    }

    #[cfg(feature = "discard")]
    fn discard_async(&self, offset: i64, len: usize, cb: AioCallback) -> Result<(), Errno> {
        self.submit(None, cb, |fd, _, _, data| unsafe {
            glfs_discard_async(fd, offset as off_t, len as size_t, gluster_finish_trampoline, data)
        })
    }

    #[cfg(not(feature = "discard"))]
    fn discard_async(&self, _offset: i64, _len: usize, _cb: AioCallback) -> Result<(), Errno> {
        Err(Errno(libc::ENOTSUP))
    }

    #[cfg(feature = "zerofill")]
    fn zerofill_async(&self, offset: i64, len: i64, cb: AioCallback) -> Result<(), Errno> {
        self.submit(None, cb, |fd, _, _, data| unsafe {
            glfs_zerofill_async(fd, offset as off_t, len as off_t, gluster_finish_trampoline, data)
        })
    }

    #[cfg(not(feature = "zerofill"))]
    fn zerofill_async(&self, _offset: i64, _len: i64, _cb: AioCallback) -> Result<(), Errno> {
        Err(Errno(libc::ENOTSUP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_cstring_rejects_interior_nul() {
        assert_eq!(cstring("vol\0x").unwrap_err(), Errno(libc::EINVAL));
        assert!(cstring("testvol").is_ok());
    }

    #[test]
    fn test_trampoline_delivers_result_and_frees_request() {
        let (tx, rx) = mpsc::channel();
        let iov = IoVector::zeroed(&[512]);
        let pending = Box::new(PendingIo {
            cb: Box::new(move |ret| {
                let _ = tx.send(ret);
            }),
            _iov: Some(iov.clone()),
            iovecs: Vec::new(),
        });
        let data = Box::into_raw(pending) as *mut c_void;
        gluster_finish_trampoline(std::ptr::null_mut(), 512, data);
        assert_eq!(rx.recv().unwrap(), 512);
        assert!(rx.try_recv().is_err());
    }
}
