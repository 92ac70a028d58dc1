//! Block-driver operations over a gluster session.
//!
//! I/O entry points are futures meant to run on the host's I/O thread next to
//! the [`AioDispatcher`](crate::aio::AioDispatcher) of the driver's context.
//! Every other operation is synchronous and never yields.

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::aio::{submit_aio, AioContext};
use crate::block::{sectors_to_bytes, BdrvFlags, Capabilities, BDRV_SECTOR_SIZE};
use crate::config::DriverConfig;
use crate::error::{GlusterError, Result};
use crate::glfs::{GlfsClient, GlfsFd, GlfsVolume, IoVector, OpenFlags, Whence};
use crate::options::{absorb_runtime_opts, CreateOption, CreateParams, OptionsDict, PreallocMode};
use crate::session::{gluster_connect, release_volume, Session};
use crate::uri::GlusterConf;

/// Session type produced by a driver over client `C`.
pub type GlusterSession<C> = Session<<C as GlfsClient>::Volume>;

/// Permissions of newly created images.
const IMAGE_MODE: u32 = (libc::S_IRUSR | libc::S_IWUSR) as u32;

/// Maps block-layer open flags to file open flags.
pub fn open_flags_for(flags: BdrvFlags) -> OpenFlags {
    let mut open_flags = OpenFlags::BINARY;
    if flags.contains(BdrvFlags::RDWR) {
        open_flags |= OpenFlags::RDWR;
    } else {
        open_flags |= OpenFlags::RDONLY;
    }
    if flags.contains(BdrvFlags::NOCACHE) {
        open_flags |= OpenFlags::DIRECT;
    }
    open_flags
}

/// Byte offset and length of a sector range.
fn byte_range(sector_num: i64, nb_sectors: i32) -> Result<(i64, i64)> {
    let end = sector_num
        .checked_add(i64::from(nb_sectors))
        .and_then(|end| end.checked_mul(BDRV_SECTOR_SIZE));
    match end {
        Some(_) if sector_num >= 0 && nb_sectors >= 0 => Ok((
            sectors_to_bytes(sector_num),
            sectors_to_bytes(i64::from(nb_sectors)),
        )),
        _ => Err(GlusterError::InvalidRequest {
            sector_num,
            nb_sectors,
        }),
    }
}

/// The gluster block driver.
pub struct GlusterDriver<C: GlfsClient> {
    client: Arc<C>,
    ctx: AioContext,
    config: DriverConfig,
    caps: Capabilities,
}

impl<C: GlfsClient> GlusterDriver<C> {
    /// A driver completing requests on `ctx`, with this build's capabilities.
    pub fn new(client: C, ctx: AioContext, config: DriverConfig) -> Self {
        Self {
            client: Arc::new(client),
            ctx,
            config,
            caps: Capabilities::BUILD,
        }
    }

    /// Overrides the capabilities `create` checks against.
    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Capabilities in effect.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// The context completions are delivered on.
    pub fn context(&self) -> &AioContext {
        &self.ctx
    }

    /// The client library.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Opens the image named by the `filename` option.
    pub fn file_open(
        &self,
        options: &mut OptionsDict,
        flags: BdrvFlags,
    ) -> Result<GlusterSession<C>> {
        let filename = absorb_runtime_opts(options)?;
        let open_flags = open_flags_for(flags);
        let session = Session::open(&*self.client, &filename, open_flags, &self.config)?;
        info!(filename = %filename, rdwr = flags.contains(BdrvFlags::RDWR), "opened gluster image");
        Ok(session)
    }

    /// Closes an open image.
    pub fn close(&self, session: GlusterSession<C>) -> Result<()> {
        session.close()
    }

    /// Creates an image of the requested size.
    ///
    /// Every handle acquired is released whatever happens; the first failing
    /// step's error is returned.
    pub fn create(&self, filename: &str, options: &[CreateOption]) -> Result<()> {
        let (glfs, conf) = gluster_connect(&*self.client, filename, &self.config)?;
        let result = self.create_image(&glfs, &conf, options);
        release_volume(glfs, &conf.volname);
        result
    }

    fn create_image(
        &self,
        glfs: &C::Volume,
        conf: &GlusterConf,
        options: &[CreateOption],
    ) -> Result<()> {
        let params = CreateParams::parse(options, self.caps)?;
        let file_err = |op: &'static str| {
            let path = conf.image.clone();
            move |errno| GlusterError::File { op, path, errno }
        };

        let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::BINARY;
        let fd = glfs
            .creat(&conf.image, flags, IMAGE_MODE)
            .map_err(file_err("glfs_creat"))?;

        let size = params.size_bytes();
        let mut result = fd.ftruncate(size).map_err(file_err("glfs_ftruncate"));
        if result.is_ok() && params.prealloc == PreallocMode::Full {
            result = fd.zerofill(0, size).map_err(file_err("glfs_zerofill"));
        }

        if let Err(errno) = fd.close() {
            if result.is_ok() {
                result = Err(file_err("glfs_close")(errno));
            }
        }

        if result.is_ok() {
            debug!(image = %conf.image, size, prealloc = ?params.prealloc, "created gluster image");
        }
        result
    }

    async fn co_rw(
        &self,
        session: &GlusterSession<C>,
        sector_num: i64,
        nb_sectors: i32,
        qiov: &IoVector,
        write: bool,
    ) -> Result<()> {
        let fd = session.fd()?;
        let (offset, size) = byte_range(sector_num, nb_sectors)?;
        trace!(offset, size, write, "gluster rw");

        if write {
            submit_aio(&self.ctx, "glfs_pwritev_async", size, |cb| {
                fd.pwritev_async(qiov, offset, cb)
            })
            .await
        } else {
            submit_aio(&self.ctx, "glfs_preadv_async", size, |cb| {
                fd.preadv_async(qiov, offset, cb)
            })
            .await
        }
    }

    /// Reads `nb_sectors` sectors at `sector_num` into `qiov`.
    pub async fn co_readv(
        &self,
        session: &GlusterSession<C>,
        sector_num: i64,
        nb_sectors: i32,
        qiov: &IoVector,
    ) -> Result<()> {
        self.co_rw(session, sector_num, nb_sectors, qiov, false).await
    }

    /// Writes `qiov` as `nb_sectors` sectors at `sector_num`.
    pub async fn co_writev(
        &self,
        session: &GlusterSession<C>,
        sector_num: i64,
        nb_sectors: i32,
        qiov: &IoVector,
    ) -> Result<()> {
        self.co_rw(session, sector_num, nb_sectors, qiov, true).await
    }

    /// Flushes the image to stable storage.
    pub async fn co_flush_to_disk(&self, session: &GlusterSession<C>) -> Result<()> {
        let fd = session.fd()?;
        submit_aio(&self.ctx, "glfs_fsync_async", 0, |cb| fd.fsync_async(cb)).await
    }

    /// Discards a sector range.
    #[cfg(feature = "discard")]
    pub async fn co_discard(
        &self,
        session: &GlusterSession<C>,
        sector_num: i64,
        nb_sectors: i32,
    ) -> Result<()> {
        let fd = session.fd()?;
        let (offset, size) = byte_range(sector_num, nb_sectors)?;
        submit_aio(&self.ctx, "glfs_discard_async", 0, |cb| {
            fd.discard_async(offset, size as usize, cb)
        })
        .await
    }

    /// Writes zeroes over a sector range.
    #[cfg(feature = "zerofill")]
    pub async fn co_write_zeroes(
        &self,
        session: &GlusterSession<C>,
        sector_num: i64,
        nb_sectors: i32,
    ) -> Result<()> {
        let fd = session.fd()?;
        let (offset, size) = byte_range(sector_num, nb_sectors)?;
        submit_aio(&self.ctx, "glfs_zerofill_async", size, |cb| {
            fd.zerofill_async(offset, size, cb)
        })
        .await
    }

    /// Sets the image length.
    pub fn truncate(&self, session: &GlusterSession<C>, offset: i64) -> Result<()> {
        session
            .fd()?
            .ftruncate(offset)
            .map_err(|errno| GlusterError::File {
                op: "glfs_ftruncate",
                path: session.conf().image.clone(),
                errno,
            })
    }

    /// Image length in bytes, taken from the end-of-file offset.
    ///
    /// Not stable against writes extending the file concurrently.
    pub fn getlength(&self, session: &GlusterSession<C>) -> Result<i64> {
        session
            .fd()?
            .lseek(0, Whence::End)
            .map_err(|errno| GlusterError::File {
                op: "glfs_lseek",
                path: session.conf().image.clone(),
                errno,
            })
    }

    /// Bytes of storage allocated to the image.
    pub fn get_allocated_file_size(&self, session: &GlusterSession<C>) -> Result<i64> {
        let st = session
            .fd()?
            .fstat()
            .map_err(|errno| GlusterError::File {
                op: "glfs_fstat",
                path: session.conf().image.clone(),
                errno,
            })?;
        Ok(st.st_blocks * BDRV_SECTOR_SIZE)
    }

    /// Gluster volumes may sit on block devices with arbitrary contents, so
    /// new images are never known to read as zeroes.
    pub fn has_zero_init(&self, _session: &GlusterSession<C>) -> bool {
        false
    }
}
