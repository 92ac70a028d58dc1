#![warn(missing_docs)]

//! GlusterFS block driver: exposes an image file on a GlusterFS volume as a
//! virtual disk to a coroutine-based host block layer.
//!
//! An image is named by a `gluster[+transport]://` location ([`uri`]). Opening
//! it connects a volume handle and opens the image file ([`session`]). I/O is
//! submitted asynchronously to the client library, whose worker threads
//! complete it; completions are carried back to the host's I/O thread through
//! bottom halves ([`aio`]). The driver operations live in [`driver`] and are
//! published under four protocol names by [`registry`].

pub mod aio;
pub mod block;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod glfs;
pub mod mock_glfs;
pub mod options;
pub mod registry;
pub mod session;
pub mod uri;

#[cfg(feature = "gfapi")]
pub mod gfapi;

pub use aio::{
    classify_completion, gluster_finish_aiocb, submit_aio, AioContext, AioDispatcher, BottomHalf,
    GlusterAiocb,
};
pub use block::{BdrvFlags, Capabilities, BDRV_SECTOR_BITS, BDRV_SECTOR_SIZE};
pub use config::DriverConfig;
pub use driver::{open_flags_for, GlusterDriver, GlusterSession};
pub use error::{GlusterError, Result, GLUSTER_USAGE};
pub use glfs::{
    AioCallback, Errno, FileStat, GlfsClient, GlfsFd, GlfsLogLevel, GlfsVolume, IoVector,
    OpenFlags, Whence,
};
pub use mock_glfs::{MockFaults, MockGlfs};
pub use options::{
    CreateOption, CreateParams, OptionValue, OptionsDict, PreallocMode, BLOCK_OPT_PREALLOC,
    BLOCK_OPT_SIZE, GLUSTER_CREATE_OPTIONS,
};
pub use registry::{
    bdrv_gluster_init, BlockDriver, BlockDriverRegistry, BlockDriverState, GLUSTER_PROTOCOLS,
};
pub use session::{gluster_connect, gluster_init, Session};
pub use uri::{parse_uri, GlusterConf, GlusterServer, Transport};

#[cfg(feature = "gfapi")]
pub use gfapi::{GfapiClient, GfapiFd, GfapiVolume};
