//! `glfs-img` command line.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::aio::AioContext;
use crate::block::BdrvFlags;
use crate::config::DriverConfig;
use crate::driver::GlusterDriver;
use crate::glfs::GlfsClient;
use crate::options::{CreateOption, OptionsDict, BLOCK_OPT_SIZE};
use crate::registry::{bdrv_gluster_init, BlockDriverRegistry, BlockDriverState};
use crate::uri::parse_uri;

/// Command line of `glfs-img`.
#[derive(Parser)]
#[command(name = "glfs-img")]
#[command(about = "Create and inspect disk images on GlusterFS volumes", long_about = None)]
pub struct Cli {
    /// Driver settings file (.toml or .json).
    #[arg(short, long, env = "GLFS_IMG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// `glfs-img` subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Print the parsed form of an image location.
    Parse {
        /// Image location.
        uri: String,
    },
    /// Create an image.
    Create {
        /// Image location.
        uri: String,
        /// Size in bytes; k, M, G and T suffixes are accepted.
        size: String,
        /// Preallocation mode (off, full).
        #[arg(short, long, default_value = "off")]
        preallocation: String,
    },
    /// Print the virtual and allocated size of an image.
    Info {
        /// Image location.
        uri: String,
    },
    /// List the registered protocols.
    Drivers,
}

#[derive(Serialize)]
struct ImageInfo<'a> {
    filename: &'a str,
    protocol: &'a str,
    virtual_size: i64,
    allocated_size: i64,
    zero_init: bool,
}

fn errno_error(ret: i64) -> io::Error {
    io::Error::from_raw_os_error((-ret) as i32)
}

impl Cli {
    /// Loads the settings file if one was given.
    pub fn load_config(&self) -> Result<DriverConfig> {
        match &self.config {
            Some(path) => DriverConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(DriverConfig::default()),
        }
    }

    /// Runs the command against `client` and returns what it prints.
    pub fn execute<C: GlfsClient>(&self, client: C, config: DriverConfig) -> Result<String> {
        let (ctx, _dispatcher) = AioContext::new();
        let driver = Arc::new(GlusterDriver::new(client, ctx, config));
        let mut registry = BlockDriverRegistry::new();
        bdrv_gluster_init(&mut registry, driver);

        match &self.command {
            Command::Parse { uri } => {
                let conf = parse_uri(uri)?;
                Ok(serde_json::to_string_pretty(&conf)?)
            }
            Command::Create {
                uri,
                size,
                preallocation,
            } => {
                let drv = match registry.find_protocol(uri) {
                    Some(drv) => drv,
                    None => bail!("no gluster driver for '{}'", uri),
                };
                let options = [
                    CreateOption::parse(BLOCK_OPT_SIZE, size)?,
                    CreateOption::preallocation(Some(preallocation.as_str())),
                ];
                let ret = drv.bdrv_create(uri, &options);
                if ret < 0 {
                    return Err(errno_error(i64::from(ret)))
                        .with_context(|| format!("{}: error while creating image", uri));
                }
                Ok(format!(
                    "Formatting '{}', fmt=raw size={} preallocation={}",
                    uri, size, preallocation
                ))
            }
            Command::Info { uri } => {
                let drv = match registry.find_protocol(uri) {
                    Some(drv) => drv,
                    None => bail!("no gluster driver for '{}'", uri),
                };
                let mut bs = BlockDriverState::new();
                let mut options = OptionsDict::new();
                options.insert("filename".to_string(), uri.clone());
                let ret = drv.bdrv_file_open(&mut bs, &mut options, BdrvFlags::NONE);
                if ret < 0 {
                    return Err(errno_error(i64::from(ret)))
                        .with_context(|| format!("could not open '{}'", uri));
                }

                let virtual_size = drv.bdrv_getlength(&bs);
                let allocated_size = drv.bdrv_get_allocated_file_size(&bs);
                let zero_init = drv.bdrv_has_zero_init(&bs) != 0;
                drv.bdrv_close(&mut bs);
                if virtual_size < 0 {
                    return Err(errno_error(virtual_size)).context("could not get image size");
                }
                if allocated_size < 0 {
                    return Err(errno_error(allocated_size))
                        .context("could not get allocated size");
                }

                let info = ImageInfo {
                    filename: uri,
                    protocol: drv.protocol_name,
                    virtual_size,
                    allocated_size,
                    zero_init,
                };
                Ok(serde_json::to_string_pretty(&info)?)
            }
            Command::Drivers => {
                let mut out: Vec<String> =
                    registry.protocols().iter().map(|p| p.to_string()).collect();
                if let Some(drv) = registry.find_format("gluster") {
                    out.push(format!("capabilities: {}", drv.capabilities));
                }
                Ok(out.join("\n"))
            }
        }
    }
}
