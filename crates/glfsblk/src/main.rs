#![warn(missing_docs)]

//! `glfs-img`: create and inspect disk images on GlusterFS volumes.

use anyhow::Result;
use clap::Parser;
use glfsblk::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    #[cfg(feature = "gfapi")]
    let client = glfsblk::GfapiClient::new();

    #[cfg(not(feature = "gfapi"))]
    let client = {
        tracing::warn!("built without gfapi, using the in-process volume backend");
        glfsblk::MockGlfs::with_auto_create(config.mock_workers)?
    };

    let out = cli.execute(client, config)?;
    println!("{}", out);
    Ok(())
}
