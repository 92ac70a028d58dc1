//! In-process GlusterFS client.
//!
//! Volumes and files live in memory. Asynchronous requests run on a private
//! multi-threaded tokio runtime, so completion callbacks arrive on threads the
//! caller does not own, the same way libgfapi's event threads deliver them.
//! [`MockFaults`] injects failures at every library entry point.

use std::collections::BTreeMap;
use std::io;
use std::iter;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::block::BDRV_SECTOR_SIZE;
use crate::glfs::{
    AioCallback, Errno, FileStat, GlfsClient, GlfsFd, GlfsLogLevel, GlfsVolume, IoVector,
    OpenFlags, Whence,
};
use crate::uri::Transport;

const SECTOR: u64 = BDRV_SECTOR_SIZE as u64;

type SharedFile = Arc<RwLock<MockFile>>;
type FileTable = Arc<DashMap<String, SharedFile>>;

/// Failures to inject. A field that is `Some` applies to every matching call
/// until the plan is replaced.
#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    /// `new_volume` fails.
    pub new_volume: Option<Errno>,
    /// `set_volfile_server` fails.
    pub set_volfile_server: Option<Errno>,
    /// `set_logging` fails.
    pub set_logging: Option<Errno>,
    /// `init` fails.
    pub init: Option<Errno>,
    /// `fini` fails (the handle is still released).
    pub fini: Option<Errno>,
    /// `open` fails.
    pub open: Option<Errno>,
    /// `creat` fails.
    pub creat: Option<Errno>,
    /// `close` fails (the fd is still released).
    pub close: Option<Errno>,
    /// `ftruncate` fails.
    pub ftruncate: Option<Errno>,
    /// Synchronous `zerofill` fails.
    pub zerofill: Option<Errno>,
    /// `fstat` fails.
    pub fstat: Option<Errno>,
    /// `lseek` fails.
    pub lseek: Option<Errno>,
    /// Asynchronous submissions are rejected synchronously.
    pub submit: Option<Errno>,
    /// Asynchronous requests complete with this error and do nothing.
    pub aio_error: Option<Errno>,
    /// Asynchronous requests complete reporting this byte count.
    pub short_transfer: Option<isize>,
}

/// One sector of a file. `None` is allocated but all zeroes.
type Sector = Option<Box<[u8; SECTOR as usize]>>;

/// A sparse file: only allocated sectors are stored.
#[derive(Debug, Default)]
struct MockFile {
    len: u64,
    sectors: BTreeMap<u64, Sector>,
    mode: u32,
}

/// Splits `[offset, end)` at sector boundaries into each sector and the byte
/// range covered within it.
fn sector_spans(offset: u64, end: u64) -> impl Iterator<Item = (u64, Range<usize>)> {
    let mut pos = offset;
    iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let sector = pos / SECTOR;
        let base = sector * SECTOR;
        let span = (pos - base) as usize..(end - base).min(SECTOR) as usize;
        pos = base + SECTOR;
        Some((sector, span))
    })
}

impl MockFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn sector_mut(&mut self, sector: u64) -> &mut [u8; SECTOR as usize] {
        self.sectors
            .entry(sector)
            .or_insert(None)
            .get_or_insert_with(|| Box::new([0; SECTOR as usize]))
    }

    /// Copies `out.len()` bytes at `offset`; holes read as zeroes.
    fn copy_out(&self, offset: u64, out: &mut [u8]) {
        let mut done = 0;
        for (sector, span) in sector_spans(offset, offset + out.len() as u64) {
            let dst = &mut out[done..done + span.len()];
            match self.sectors.get(&sector) {
                Some(Some(data)) => dst.copy_from_slice(&data[span.clone()]),
                _ => dst.fill(0),
            }
            done += span.len();
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) {
        let end = offset + buf.len() as u64;
        let mut done = 0;
        for (sector, span) in sector_spans(offset, end) {
            let n = span.len();
            self.sector_mut(sector)[span].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        self.len = self.len.max(end);
    }

    fn read_at(&self, offset: u64, buffers: &mut [Vec<u8>]) -> usize {
        let mut pos = offset;
        let mut read = 0;
        for buf in buffers.iter_mut() {
            if pos >= self.len {
                break;
            }
            let n = buf.len().min((self.len - pos) as usize);
            self.copy_out(pos, &mut buf[..n]);
            pos += n as u64;
            read += n;
            if n < buf.len() {
                break;
            }
        }
        read
    }

    fn truncate(&mut self, len: u64) {
        let keep = len.div_ceil(SECTOR);
        self.sectors.retain(|&sector, _| sector < keep);
        let tail = (len % SECTOR) as usize;
        if let Some(Some(data)) = self.sectors.get_mut(&(len / SECTOR)) {
            data[tail..].fill(0);
        }
        self.len = len;
    }

    fn zero_range(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        for (sector, span) in sector_spans(offset, end) {
            let slot = self.sectors.entry(sector).or_insert(None);
            if span.len() == SECTOR as usize {
                *slot = None;
            } else if let Some(data) = slot {
                data[span].fill(0);
            }
        }
        self.len = self.len.max(end);
    }

    fn discard(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len).min(self.len);
        for (sector, span) in sector_spans(offset, end) {
            if span.len() == SECTOR as usize {
                self.sectors.remove(&sector);
            } else if let Some(Some(data)) = self.sectors.get_mut(&sector) {
                data[span].fill(0);
            }
        }
    }

    fn contents(&self) -> Vec<u8> {
        let mut data = vec![0; self.len as usize];
        self.copy_out(0, &mut data);
        data
    }

    fn stat(&self) -> FileStat {
        FileStat {
            st_size: self.len as i64,
            st_blocks: self.sectors.len() as i64,
            st_blksize: 4096,
            st_mode: libc::S_IFREG as u32 | self.mode,
        }
    }
}

struct MockCluster {
    volumes: DashMap<String, FileTable>,
    auto_create: bool,
    faults: Mutex<MockFaults>,
    volfile_servers: Mutex<Vec<(Transport, String, u16)>>,
    logging: Mutex<Vec<(String, GlfsLogLevel)>>,
    live_volumes: AtomicUsize,
    open_fds: AtomicUsize,
    workers: Option<Runtime>,
}

impl MockCluster {
    fn faults(&self) -> MockFaults {
        self.faults.lock().clone()
    }

    fn file(&self, volname: &str, path: &str) -> Option<SharedFile> {
        let files = self.volumes.get(volname)?.value().clone();
        let file = files.get(path)?.value().clone();
        Some(file)
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown_background();
        }
    }
}

fn fail(fault: Option<Errno>) -> Result<(), Errno> {
    match fault {
        Some(errno) => Err(errno),
        None => Ok(()),
    }
}

fn checked_offset(offset: i64) -> Result<u64, Errno> {
    u64::try_from(offset).map_err(|_| Errno(libc::EINVAL))
}

/// In-memory GlusterFS client. Clones share the same cluster.
#[derive(Clone)]
pub struct MockGlfs {
    cluster: Arc<MockCluster>,
}

impl MockGlfs {
    /// A client whose `init` fails with `ENOENT` for volumes not added with
    /// [`MockGlfs::add_volume`].
    pub fn new(workers: usize) -> io::Result<Self> {
        Self::build(workers, false)
    }

    /// A client that creates volumes on first connect.
    pub fn with_auto_create(workers: usize) -> io::Result<Self> {
        Self::build(workers, true)
    }

    fn build(workers: usize, auto_create: bool) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("glfs-mock-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            cluster: Arc::new(MockCluster {
                volumes: DashMap::new(),
                auto_create,
                faults: Mutex::new(MockFaults::default()),
                volfile_servers: Mutex::new(Vec::new()),
                logging: Mutex::new(Vec::new()),
                live_volumes: AtomicUsize::new(0),
                open_fds: AtomicUsize::new(0),
                workers: Some(runtime),
            }),
        })
    }

    /// Adds an empty volume.
    pub fn add_volume(&self, volname: &str) {
        self.cluster
            .volumes
            .entry(volname.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()));
    }

    /// Creates or replaces a file; every sector it covers counts as allocated.
    pub fn write_file(&self, volname: &str, path: &str, data: &[u8]) -> Result<(), Errno> {
        let files = self
            .cluster
            .volumes
            .get(volname)
            .map(|v| v.value().clone())
            .ok_or(Errno(libc::ENOENT))?;
        let mut file = MockFile {
            mode: 0o600,
            ..MockFile::default()
        };
        file.write_at(0, data);
        files.insert(path.to_string(), Arc::new(RwLock::new(file)));
        Ok(())
    }

    /// Contents of a file.
    pub fn file_contents(&self, volname: &str, path: &str) -> Option<Vec<u8>> {
        self.cluster
            .file(volname, path)
            .map(|file| file.read().contents())
    }

    /// Status of a file.
    pub fn file_stat(&self, volname: &str, path: &str) -> Option<FileStat> {
        self.cluster.file(volname, path).map(|file| file.read().stat())
    }

    /// Replaces the fault plan.
    pub fn set_faults(&self, faults: MockFaults) {
        *self.cluster.faults.lock() = faults;
    }

    /// Clears every injected fault.
    pub fn clear_faults(&self) {
        self.set_faults(MockFaults::default());
    }

    /// Volume handles allocated and not yet finalized.
    pub fn live_volumes(&self) -> usize {
        self.cluster.live_volumes.load(Ordering::SeqCst)
    }

    /// File handles opened and not yet closed.
    pub fn open_fds(&self) -> usize {
        self.cluster.open_fds.load(Ordering::SeqCst)
    }

    /// Every `set_volfile_server` call, in order.
    pub fn volfile_servers(&self) -> Vec<(Transport, String, u16)> {
        self.cluster.volfile_servers.lock().clone()
    }

    /// Every `set_logging` call, in order.
    pub fn logging_calls(&self) -> Vec<(String, GlfsLogLevel)> {
        self.cluster.logging.lock().clone()
    }
}

impl GlfsClient for MockGlfs {
    type Volume = MockVolume;

    fn new_volume(&self, volname: &str) -> Result<MockVolume, Errno> {
        fail(self.cluster.faults().new_volume)?;
        self.cluster.live_volumes.fetch_add(1, Ordering::SeqCst);
        debug!(volname, "mock volume handle allocated");
        Ok(MockVolume {
            cluster: Arc::clone(&self.cluster),
            volname: volname.to_string(),
            files: None,
        })
    }
}

/// Volume handle of [`MockGlfs`].
pub struct MockVolume {
    cluster: Arc<MockCluster>,
    volname: String,
    files: Option<FileTable>,
}

impl MockVolume {
    fn files(&self) -> Result<&FileTable, Errno> {
        self.files.as_ref().ok_or(Errno(libc::ENOTCONN))
    }

    fn fd(&self, path: &str, file: SharedFile, flags: OpenFlags) -> MockFd {
        self.cluster.open_fds.fetch_add(1, Ordering::SeqCst);
        MockFd {
            cluster: Arc::clone(&self.cluster),
            path: path.to_string(),
            file,
            flags,
            pos: Mutex::new(0),
        }
    }
}

impl GlfsVolume for MockVolume {
    type Fd = MockFd;

    fn set_volfile_server(
        &mut self,
        transport: Transport,
        host: &str,
        port: u16,
    ) -> Result<(), Errno> {
        fail(self.cluster.faults().set_volfile_server)?;
        self.cluster
            .volfile_servers
            .lock()
            .push((transport, host.to_string(), port));
        Ok(())
    }

    fn set_logging(&mut self, logfile: &str, level: GlfsLogLevel) -> Result<(), Errno> {
        fail(self.cluster.faults().set_logging)?;
        self.cluster.logging.lock().push((logfile.to_string(), level));
        Ok(())
    }

    fn init(&mut self) -> Result<(), Errno> {
        fail(self.cluster.faults().init)?;
        let files = match self.cluster.volumes.get(&self.volname) {
            Some(files) => files.value().clone(),
            None if self.cluster.auto_create => self
                .cluster
                .volumes
                .entry(self.volname.clone())
                .or_insert_with(|| Arc::new(DashMap::new()))
                .value()
                .clone(),
            None => return Err(Errno(libc::ENOENT)),
        };
        self.files = Some(files);
        Ok(())
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<MockFd, Errno> {
        fail(self.cluster.faults().open)?;
        let file = self
            .files()?
            .get(path)
            .map(|f| f.value().clone())
            .ok_or(Errno(libc::ENOENT))?;
        Ok(self.fd(path, file, flags))
    }

    fn creat(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<MockFd, Errno> {
        fail(self.cluster.faults().creat)?;
        let file = self
            .files()?
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(MockFile {
                    mode,
                    ..MockFile::default()
                }))
            })
            .value()
            .clone();
        if flags.contains(OpenFlags::TRUNC) {
            file.write().truncate(0);
        }
        Ok(self.fd(path, file, flags))
    }

    fn fini(self) -> Result<(), Errno> {
        self.cluster.live_volumes.fetch_sub(1, Ordering::SeqCst);
        debug!(volname = %self.volname, "mock volume handle finalized");
        fail(self.cluster.faults().fini)
    }
}

/// File handle of [`MockGlfs`].
pub struct MockFd {
    cluster: Arc<MockCluster>,
    path: String,
    file: SharedFile,
    flags: OpenFlags,
    pos: Mutex<i64>,
}

impl MockFd {
    fn require_writable(&self) -> Result<(), Errno> {
        if self.flags.is_writable() {
            Ok(())
        } else {
            Err(Errno(libc::EBADF))
        }
    }

    /// Runs `op` on a worker thread and hands its result to `cb` there.
    fn submit<F>(&self, op: F, cb: AioCallback) -> Result<(), Errno>
    where
        F: FnOnce() -> isize + Send + 'static,
    {
        let faults = self.cluster.faults();
        fail(faults.submit)?;
        let workers = self
            .cluster
            .workers
            .as_ref()
            .ok_or(Errno(libc::ESHUTDOWN))?;
        workers.spawn(async move {
            let ret = match faults.aio_error {
                Some(errno) => -(errno.raw() as isize),
                None => {
                    let done = op();
                    faults.short_transfer.unwrap_or(done)
                }
            };
            cb(ret);
        });
        Ok(())
    }
}

impl GlfsFd for MockFd {
    fn close(self) -> Result<(), Errno> {
        self.cluster.open_fds.fetch_sub(1, Ordering::SeqCst);
        debug!(path = %self.path, "mock fd closed");
        fail(self.cluster.faults().close)
    }

    fn ftruncate(&self, length: i64) -> Result<(), Errno> {
        fail(self.cluster.faults().ftruncate)?;
        self.require_writable()?;
        let length = checked_offset(length)?;
        self.file.write().truncate(length);
        Ok(())
    }

    fn lseek(&self, offset: i64, whence: Whence) -> Result<i64, Errno> {
        fail(self.cluster.faults().lseek)?;
        let mut pos = self.pos.lock();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *pos,
            Whence::End => self.file.read().len() as i64,
        };
        let target = base.checked_add(offset).ok_or(Errno(libc::EOVERFLOW))?;
        if target < 0 {
            return Err(Errno(libc::EINVAL));
        }
        *pos = target;
        Ok(target)
    }

    fn fstat(&self) -> Result<FileStat, Errno> {
        fail(self.cluster.faults().fstat)?;
        Ok(self.file.read().stat())
    }

    fn zerofill(&self, offset: i64, len: i64) -> Result<(), Errno> {
        fail(self.cluster.faults().zerofill)?;
        self.require_writable()?;
        let offset = checked_offset(offset)?;
        let len = checked_offset(len)?;
        self.file.write().zero_range(offset, len);
        Ok(())
    }

    fn preadv_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno> {
        if !self.flags.is_readable() {
            return Err(Errno(libc::EBADF));
        }
        let offset = checked_offset(offset)?;
        let file = Arc::clone(&self.file);
        let iov = iov.clone();
        self.submit(
            move || {
                let mut buffers = iov.lock();
                let read = file.read().read_at(offset, &mut buffers);
                read as isize
            },
            cb,
        )
    }

    fn pwritev_async(&self, iov: &IoVector, offset: i64, cb: AioCallback) -> Result<(), Errno> {
        self.require_writable()?;
        let offset = checked_offset(offset)?;
        let file = Arc::clone(&self.file);
        let iov = iov.clone();
        self.submit(
            move || {
                let data = iov.to_bytes();
                file.write().write_at(offset, &data);
                data.len() as isize
            },
            cb,
        )
    }

    fn fsync_async(&self, cb: AioCallback) -> Result<(), Errno> {
        self.submit(|| 0, cb)
    }

    fn discard_async(&self, offset: i64, len: usize, cb: AioCallback) -> Result<(), Errno> {
        self.require_writable()?;
        let offset = checked_offset(offset)?;
        let file = Arc::clone(&self.file);
        self.submit(
            move || {
                file.write().discard(offset, len as u64);
                0
            },
            cb,
        )
    }

    fn zerofill_async(&self, offset: i64, len: i64, cb: AioCallback) -> Result<(), Errno> {
        self.require_writable()?;
        let offset = checked_offset(offset)?;
        let len = checked_offset(len)?;
        let file = Arc::clone(&self.file);
        self.submit(
            move || {
                file.write().zero_range(offset, len);
                0
            },
            cb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn connected(glfs: &MockGlfs, volname: &str) -> MockVolume {
        let mut vol = glfs.new_volume(volname).unwrap();
        vol.init().unwrap();
        vol
    }

    fn wait(rx: &mpsc::Receiver<(isize, String)>) -> (isize, String) {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn callback(tx: mpsc::Sender<(isize, String)>) -> AioCallback {
        Box::new(move |ret| {
            let name = std::thread::current().name().unwrap_or("").to_string();
            let _ = tx.send((ret, name));
        })
    }

    #[test]
    fn test_unknown_volume_fails_init() {
        let glfs = MockGlfs::new(1).unwrap();
        let mut vol = glfs.new_volume("missing").unwrap();
        assert_eq!(vol.init().unwrap_err(), Errno(libc::ENOENT));
        assert_eq!(glfs.live_volumes(), 1);
        vol.fini().unwrap();
        assert_eq!(glfs.live_volumes(), 0);
    }

    #[test]
    fn test_auto_create_volume() {
        let glfs = MockGlfs::with_auto_create(1).unwrap();
        let vol = connected(&glfs, "fresh");
        let fd = vol
            .creat("a.img", OpenFlags::WRONLY | OpenFlags::CREAT, 0o600)
            .unwrap();
        fd.close().unwrap();
        assert_eq!(glfs.file_contents("fresh", "a.img"), Some(Vec::new()));
        vol.fini().unwrap();
    }

    #[test]
    fn test_open_before_init_is_enotconn() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        let vol = glfs.new_volume("vol").unwrap();
        assert_eq!(
            vol.open("a.img", OpenFlags::RDONLY).err(),
            Some(Errno(libc::ENOTCONN))
        );
        vol.fini().unwrap();
    }

    #[test]
    fn test_write_completes_on_worker_thread() {
        let glfs = MockGlfs::new(2).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDWR).unwrap();

        let (tx, rx) = mpsc::channel();
        let iov = IoVector::from_buffers(vec![vec![7u8; 512], vec![9u8; 512]]);
        fd.pwritev_async(&iov, 1024, callback(tx)).unwrap();
        let (ret, thread) = wait(&rx);
        assert_eq!(ret, 1024);
        assert_eq!(thread, "glfs-mock-worker");

        let stat = fd.fstat().unwrap();
        assert_eq!(stat.st_size, 2048);
        assert_eq!(stat.st_blocks, 2);

        fd.close().unwrap();
        vol.fini().unwrap();
        assert_eq!(glfs.open_fds(), 0);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[1u8; 700]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDONLY).unwrap();

        let (tx, rx) = mpsc::channel();
        let iov = IoVector::zeroed(&[512, 512]);
        fd.preadv_async(&iov, 0, callback(tx.clone())).unwrap();
        assert_eq!(wait(&rx).0, 700);

        fd.preadv_async(&iov, 4096, callback(tx)).unwrap();
        assert_eq!(wait(&rx).0, 0);

        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_read_only_fd_rejects_writes() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[0u8; 512]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDONLY).unwrap();
        let (tx, _rx) = mpsc::channel();
        let iov = IoVector::zeroed(&[512]);
        assert_eq!(
            fd.pwritev_async(&iov, 0, callback(tx)).err(),
            Some(Errno(libc::EBADF))
        );
        assert_eq!(fd.ftruncate(0).err(), Some(Errno(libc::EBADF)));
        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_truncate_and_discard_release_sectors() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[5u8; 4096]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDWR).unwrap();
        assert_eq!(fd.fstat().unwrap().st_blocks, 8);

        let (tx, rx) = mpsc::channel();
        fd.discard_async(1024, 1024, callback(tx)).unwrap();
        assert_eq!(wait(&rx).0, 0);
        assert_eq!(fd.fstat().unwrap().st_blocks, 6);
        let data = glfs.file_contents("vol", "a.img").unwrap();
        assert!(data[1024..2048].iter().all(|&b| b == 0));
        assert_eq!(data[0], 5);

        fd.ftruncate(1000).unwrap();
        let stat = fd.fstat().unwrap();
        assert_eq!(stat.st_size, 1000);
        assert_eq!(stat.st_blocks, 2);

        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_large_truncate_stays_sparse() {
        const GIB: i64 = 1 << 30;
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[5u8; 4096]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDWR).unwrap();

        fd.ftruncate(100 * GIB).unwrap();
        let stat = fd.fstat().unwrap();
        assert_eq!(stat.st_size, 100 * GIB);
        assert_eq!(stat.st_blocks, 8);
        assert_eq!(fd.lseek(0, Whence::End).unwrap(), 100 * GIB);

        let (tx, rx) = mpsc::channel();
        let iov = IoVector::from_buffers(vec![vec![9u8; 512]]);
        fd.pwritev_async(&iov, 64 * GIB, callback(tx.clone())).unwrap();
        assert_eq!(wait(&rx).0, 512);
        assert_eq!(fd.fstat().unwrap().st_blocks, 9);

        let out = IoVector::zeroed(&[512, 512]);
        fd.preadv_async(&out, 64 * GIB - 512, callback(tx)).unwrap();
        assert_eq!(wait(&rx).0, 1024);
        let bytes = out.to_bytes();
        assert!(bytes[..512].iter().all(|&b| b == 0));
        assert!(bytes[512..].iter().all(|&b| b == 9));

        fd.ftruncate(1000).unwrap();
        assert_eq!(fd.fstat().unwrap().st_blocks, 2);
        fd.ftruncate(2048).unwrap();
        let data = glfs.file_contents("vol", "a.img").unwrap();
        assert_eq!(data.len(), 2048);
        assert!(data[..1000].iter().all(|&b| b == 5));
        assert!(data[1000..].iter().all(|&b| b == 0));

        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_zero_range_allocates_without_data() {
        let mut file = MockFile::default();
        file.write_at(0, &[3u8; 1024]);
        file.zero_range(256, 1024);
        assert_eq!(file.len(), 1280);
        assert_eq!(file.stat().st_blocks, 3);
        let data = file.contents();
        assert!(data[..256].iter().all(|&b| b == 3));
        assert!(data[256..].iter().all(|&b| b == 0));
        assert_eq!(file.sectors.get(&1), Some(&None));
    }

    #[test]
    fn test_lseek_end_reports_length() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[0u8; 3000]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDONLY).unwrap();
        assert_eq!(fd.lseek(0, Whence::End).unwrap(), 3000);
        assert_eq!(fd.lseek(-1000, Whence::Cur).unwrap(), 2000);
        assert_eq!(fd.lseek(-1, Whence::Set).err(), Some(Errno(libc::EINVAL)));
        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_faults_shape_completions() {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("vol");
        glfs.write_file("vol", "a.img", &[0u8; 4096]).unwrap();
        let vol = connected(&glfs, "vol");
        let fd = vol.open("a.img", OpenFlags::RDWR).unwrap();
        let iov = IoVector::zeroed(&[4096]);
        let (tx, rx) = mpsc::channel();

        glfs.set_faults(MockFaults {
            submit: Some(Errno(libc::EAGAIN)),
            ..MockFaults::default()
        });
        assert_eq!(
            fd.pwritev_async(&iov, 0, callback(tx.clone())).err(),
            Some(Errno(libc::EAGAIN))
        );

        glfs.set_faults(MockFaults {
            aio_error: Some(Errno(libc::ENOSPC)),
            ..MockFaults::default()
        });
        fd.pwritev_async(&iov, 0, callback(tx.clone())).unwrap();
        assert_eq!(wait(&rx).0, -(libc::ENOSPC as isize));

        glfs.set_faults(MockFaults {
            short_transfer: Some(100),
            ..MockFaults::default()
        });
        fd.preadv_async(&iov, 0, callback(tx)).unwrap();
        assert_eq!(wait(&rx).0, 100);

        glfs.clear_faults();
        fd.close().unwrap();
        vol.fini().unwrap();
    }

    #[test]
    fn test_records_bootstrap_calls() {
        let glfs = MockGlfs::new(1).unwrap();
        let mut vol = glfs.new_volume("vol").unwrap();
        vol.set_volfile_server(Transport::Rdma, "host", 24007).unwrap();
        vol.set_logging("-", GlfsLogLevel::Error).unwrap();
        assert_eq!(
            glfs.volfile_servers(),
            vec![(Transport::Rdma, "host".to_string(), 24007)]
        );
        assert_eq!(
            glfs.logging_calls(),
            vec![("-".to_string(), GlfsLogLevel::Error)]
        );
        vol.fini().unwrap();
    }
}
