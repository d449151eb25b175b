// SPDX-License-Identifier: GPL-3.0-only

//! COSMIC Ext Storage udev watcher
//!
//! Keeps the LVM inventory in sync with block device changes reported by
//! udev, coalescing bursts of events into single reloads.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use storage_udevwatch::{NetlinkGroup, NetlinkSource};

mod config;
mod daemon;
mod error;
mod inventory;
mod logging;

use config::{GroupSetting, Overrides, ServiceConfig};
use daemon::Daemon;
use inventory::LvmInventory;

#[derive(Debug, Parser)]
#[command(name = "cosmic-ext-storage-udevwatch")]
#[command(about = "Reload the LVM inventory when udev reports block device changes")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep udev monitoring after the first external event
    #[arg(long)]
    udev: bool,
    #[arg(long, value_enum)]
    netlink_group: Option<GroupSetting>,
    #[arg(long)]
    lvm_binary: Option<String>,
    /// Force debug logging, ignoring RUST_LOG
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    config.apply(&Overrides {
        use_udev: cli.udev,
        netlink_group: cli.netlink_group,
        lvm_binary: cli.lvm_binary,
        debug: cli.debug,
    });
    logging::init(&config.log_level, cli.debug);

    tracing::info!(
        "Starting COSMIC Ext Storage udev watcher v{}",
        env!("CARGO_PKG_VERSION")
    );

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("udev watcher must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let inventory = Arc::new(LvmInventory::new(&config.lvm_binary)?);
    let source = Arc::new(NetlinkSource::new(NetlinkGroup::from(config.netlink_group)));

    let daemon = Daemon::start(&config, source, inventory.clone(), inventory.clone()).await?;
    tracing::info!(
        "Tracking {} LVM device node(s), udev monitoring {}",
        inventory.device_count(),
        match (daemon.is_monitoring(), config.use_udev) {
            (false, _) => "inactive",
            (true, true) => "always on",
            (true, false) => "on until the first external event",
        }
    );

    let mut changes = inventory.changes();
    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!("LVM inventory changed (generation {})", *changes.borrow());
                }
            }
        }
    });

    tracing::info!("Service ready, waiting for events...");
    daemon.run().await?;

    tracing::info!("COSMIC Ext Storage udev watcher shutting down");
    Ok(())
}
