//! Driver registrations presented to the host block layer.
//!
//! The block layer picks a driver by the protocol prefix of an image name.
//! Gluster is published under four protocol names, one per transport plus the
//! bare `gluster`, all backed by the same [`GlusterDriver`].

use std::mem;
use std::sync::Arc;

use tracing::{debug, error};

use crate::block::{BdrvFlags, Capabilities};
use crate::driver::{GlusterDriver, GlusterSession};
use crate::error::{GlusterError, Result};
use crate::glfs::{GlfsClient, IoVector};
use crate::options::{CreateOption, OptionDesc, OptionsDict, GLUSTER_CREATE_OPTIONS};

/// Format name shared by every gluster registration.
pub const GLUSTER_FORMAT: &str = "gluster";

/// Protocol names in registration order.
pub const GLUSTER_PROTOCOLS: [&str; 4] = ["gluster+rdma", "gluster+unix", "gluster+tcp", "gluster"];

/// Per-image driver state owned by the block layer.
pub struct BlockDriverState<C: GlfsClient> {
    opaque: Option<GlusterSession<C>>,
}

impl<C: GlfsClient> BlockDriverState<C> {
    /// State of an image that is not open.
    pub fn new() -> Self {
        Self { opaque: None }
    }

    /// Returns true while a session is held.
    pub fn is_open(&self) -> bool {
        self.opaque.is_some()
    }

    /// The open session.
    pub fn session(&self) -> Result<&GlusterSession<C>> {
        self.opaque.as_ref().ok_or(GlusterError::NotOpen)
    }
}

impl<C: GlfsClient> Default for BlockDriverState<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn to_ret(res: Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(err) => {
            debug!(%err, "gluster request failed");
            err.to_negative_errno()
        }
    }
}

fn to_ret64(res: Result<i64>) -> i64 {
    match res {
        Ok(n) => n,
        Err(err) => i64::from(err.to_negative_errno()),
    }
}

/// One registration: metadata plus the operation table.
///
/// Operations return 0 (or a non-negative size) on success and a negative
/// error number on failure.
pub struct BlockDriver<C: GlfsClient> {
    /// Image format name.
    pub format_name: &'static str,
    /// Protocol prefix routed to this registration.
    pub protocol_name: &'static str,
    /// Size of the per-image state.
    pub instance_size: usize,
    /// Opening requires an image name.
    pub needs_filename: bool,
    /// Optional operations available in this build.
    pub capabilities: Capabilities,
    /// Parameters `bdrv_create` accepts.
    pub create_options: &'static [OptionDesc],
    driver: Arc<GlusterDriver<C>>,
}

impl<C: GlfsClient> BlockDriver<C> {
    /// A registration for `protocol_name` backed by `driver`.
    pub fn new(protocol_name: &'static str, driver: Arc<GlusterDriver<C>>) -> Self {
        Self {
            format_name: GLUSTER_FORMAT,
            protocol_name,
            instance_size: mem::size_of::<BlockDriverState<C>>(),
            needs_filename: true,
            capabilities: driver.capabilities(),
            create_options: GLUSTER_CREATE_OPTIONS,
            driver,
        }
    }

    /// The shared implementation.
    pub fn driver(&self) -> &Arc<GlusterDriver<C>> {
        &self.driver
    }

    /// Opens an image into `bs`. On failure `bs` holds nothing.
    pub fn bdrv_file_open(
        &self,
        bs: &mut BlockDriverState<C>,
        options: &mut OptionsDict,
        flags: BdrvFlags,
    ) -> i32 {
        bs.opaque = None;
        match self.driver.file_open(options, flags) {
            Ok(session) => {
                bs.opaque = Some(session);
                0
            }
            Err(err) => {
                error!(protocol = self.protocol_name, %err, "could not open gluster image");
                err.to_negative_errno()
            }
        }
    }

    /// Closes the image held by `bs`, if any.
    pub fn bdrv_close(&self, bs: &mut BlockDriverState<C>) {
        if let Some(session) = bs.opaque.take() {
            if let Err(err) = self.driver.close(session) {
                debug!(%err, "error while closing gluster image");
            }
        }
    }

    /// Creates an image.
    pub fn bdrv_create(&self, filename: &str, options: &[CreateOption]) -> i32 {
        match self.driver.create(filename, options) {
            Ok(()) => 0,
            Err(err) => {
                error!(protocol = self.protocol_name, %err, "could not create gluster image");
                err.to_negative_errno()
            }
        }
    }

    /// Image length in bytes.
    pub fn bdrv_getlength(&self, bs: &BlockDriverState<C>) -> i64 {
        to_ret64(bs.session().and_then(|s| self.driver.getlength(s)))
    }

    /// Allocated bytes.
    pub fn bdrv_get_allocated_file_size(&self, bs: &BlockDriverState<C>) -> i64 {
        to_ret64(
            bs.session()
                .and_then(|s| self.driver.get_allocated_file_size(s)),
        )
    }

    /// Sets the image length.
    pub fn bdrv_truncate(&self, bs: &BlockDriverState<C>, offset: i64) -> i32 {
        to_ret(bs.session().and_then(|s| self.driver.truncate(s, offset)))
    }

    /// Vectored sector read.
    pub async fn bdrv_co_readv(
        &self,
        bs: &BlockDriverState<C>,
        sector_num: i64,
        nb_sectors: i32,
        qiov: &IoVector,
    ) -> i32 {
        let session = match bs.session() {
            Ok(s) => s,
            Err(err) => return err.to_negative_errno(),
        };
        to_ret(
            self.driver
                .co_readv(session, sector_num, nb_sectors, qiov)
                .await,
        )
    }

    /// Vectored sector write.
    pub async fn bdrv_co_writev(
        &self,
        bs: &BlockDriverState<C>,
        sector_num: i64,
        nb_sectors: i32,
        qiov: &IoVector,
    ) -> i32 {
        let session = match bs.session() {
            Ok(s) => s,
            Err(err) => return err.to_negative_errno(),
        };
        to_ret(
            self.driver
                .co_writev(session, sector_num, nb_sectors, qiov)
                .await,
        )
    }

    /// Flush to stable storage.
    pub async fn bdrv_co_flush_to_disk(&self, bs: &BlockDriverState<C>) -> i32 {
        let session = match bs.session() {
            Ok(s) => s,
            Err(err) => return err.to_negative_errno(),
        };
        to_ret(self.driver.co_flush_to_disk(session).await)
    }

    /// Sector discard.
    #[cfg(feature = "discard")]
    pub async fn bdrv_co_discard(
        &self,
        bs: &BlockDriverState<C>,
        sector_num: i64,
        nb_sectors: i32,
    ) -> i32 {
        if !self.capabilities.discard {
            return -libc::ENOTSUP;
        }
        let session = match bs.session() {
            Ok(s) => s,
            Err(err) => return err.to_negative_errno(),
        };
        to_ret(self.driver.co_discard(session, sector_num, nb_sectors).await)
    }

    /// Sector zero-fill.
    #[cfg(feature = "zerofill")]
    pub async fn bdrv_co_write_zeroes(
        &self,
        bs: &BlockDriverState<C>,
        sector_num: i64,
        nb_sectors: i32,
    ) -> i32 {
        if !self.capabilities.zerofill {
            return -libc::ENOTSUP;
        }
        let session = match bs.session() {
            Ok(s) => s,
            Err(err) => return err.to_negative_errno(),
        };
        to_ret(
            self.driver
                .co_write_zeroes(session, sector_num, nb_sectors)
                .await,
        )
    }

    /// Always 0.
    pub fn bdrv_has_zero_init(&self, bs: &BlockDriverState<C>) -> i32 {
        match bs.session() {
            Ok(s) => i32::from(self.driver.has_zero_init(s)),
            Err(_) => 0,
        }
    }
}

/// The block layer's table of drivers.
pub struct BlockDriverRegistry<C: GlfsClient> {
    drivers: Vec<BlockDriver<C>>,
}

impl<C: GlfsClient> BlockDriverRegistry<C> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    /// Adds a registration.
    pub fn register(&mut self, drv: BlockDriver<C>) {
        debug!(
            format = drv.format_name,
            protocol = drv.protocol_name,
            "registered block driver"
        );
        self.drivers.push(drv);
    }

    /// Registered protocol names in registration order.
    pub fn protocols(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.protocol_name).collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Looks a driver up by format name. The latest registration wins.
    pub fn find_format(&self, format_name: &str) -> Option<&BlockDriver<C>> {
        self.drivers
            .iter()
            .rev()
            .find(|d| d.format_name == format_name)
    }

    /// Looks a driver up by the protocol prefix of `filename`, the text
    /// before the first `:`.
    pub fn find_protocol(&self, filename: &str) -> Option<&BlockDriver<C>> {
        let (protocol, _) = filename.split_once(':')?;
        self.drivers
            .iter()
            .rev()
            .find(|d| d.protocol_name == protocol)
    }
}

impl<C: GlfsClient> Default for BlockDriverRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the four gluster registrations over one shared driver.
pub fn bdrv_gluster_init<C: GlfsClient>(
    registry: &mut BlockDriverRegistry<C>,
    driver: Arc<GlusterDriver<C>>,
) {
    for protocol in GLUSTER_PROTOCOLS {
        registry.register(BlockDriver::new(protocol, Arc::clone(&driver)));
    }
}
