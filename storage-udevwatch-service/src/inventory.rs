// SPDX-License-Identifier: GPL-3.0-only

//! LVM device inventory backed by the `lvm` reporting commands

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use storage_udevwatch::{DeviceRegistry, InventoryLoader, LoadOptions};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{Result, ServiceError};

const REPORT_ARGS: [&str; 7] = [
    "--noheadings",
    "--units",
    "b",
    "--nosuffix",
    "--separator",
    "\t",
    "-o",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct PvRow {
    pv_name: String,
    vg_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LvRow {
    vg_name: String,
    lv_name: String,
    lv_path: Option<String>,
    lv_dm_path: Option<String>,
}

fn parse_tabbed_line(line: &str) -> Vec<String> {
    line.split('\t')
        .map(|part| part.trim().to_string())
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_pvs(output: &str) -> Vec<PvRow> {
    output
        .lines()
        .filter_map(|line| {
            if line.trim().is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 2 || cols[0].is_empty() {
                return None;
            }
            Some(PvRow {
                pv_name: cols[0].clone(),
                vg_name: non_empty(&cols[1]),
            })
        })
        .collect()
}

fn parse_lvs(output: &str) -> Vec<LvRow> {
    output
        .lines()
        .filter_map(|line| {
            if line.trim().is_empty() {
                return None;
            }
            let cols = parse_tabbed_line(line);
            if cols.len() < 4 {
                return None;
            }
            Some(LvRow {
                vg_name: cols[0].clone(),
                lv_name: cols[1].clone(),
                // Hidden LVs (thin pools, mirror legs) have no lv_path.
                lv_path: non_empty(&cols[2]),
                lv_dm_path: non_empty(&cols[3]),
            })
        })
        .collect()
}

fn index(pvs: &[PvRow], lvs: &[LvRow]) -> HashSet<String> {
    let mut identifiers: HashSet<String> = pvs.iter().map(|pv| pv.pv_name.clone()).collect();
    for lv in lvs {
        identifiers.extend(lv.lv_path.iter().cloned());
        identifiers.extend(lv.lv_dm_path.iter().cloned());
    }
    identifiers
}

/// Device nodes of every PV and LV known to LVM.
#[derive(Debug)]
pub struct LvmInventory {
    lvm: PathBuf,
    identifiers: RwLock<HashSet<String>>,
    loaded: AtomicBool,
    generation: watch::Sender<u64>,
}

impl LvmInventory {
    /// Resolve the `lvm` binary; the inventory starts empty until loaded.
    pub fn new(lvm_binary: &str) -> Result<Self> {
        let lvm = which::which(lvm_binary).map_err(|_| ServiceError::ToolMissing {
            tool: lvm_binary.to_string(),
        })?;
        Ok(Self::with_binary(lvm))
    }

    fn with_binary(lvm: PathBuf) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            lvm,
            identifiers: RwLock::new(HashSet::new()),
            loaded: AtomicBool::new(false),
            generation,
        }
    }

    /// Bumped after every load that changed the inventory with `emit_signal` set.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn device_count(&self) -> usize {
        self.identifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn run_lvm(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.lvm).args(args).output().await?;
        if !output.status.success() {
            return Err(ServiceError::CommandFailed {
                command: format!("lvm {}", args.first().copied().unwrap_or_default()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn report(&self, command: &str, fields: &str) -> Result<String> {
        let mut args = vec![command];
        args.extend(REPORT_ARGS);
        args.push(fields);
        self.run_lvm(&args).await
    }

    async fn query(&self, options: LoadOptions) -> Result<HashSet<String>> {
        if options.cache_refresh
            && let Err(e) = self.run_lvm(&["pvscan", "--cache"]).await
        {
            tracing::warn!("LVM device cache refresh failed: {e}");
        }

        let pvs = parse_pvs(&self.report("pvs", "pv_name,vg_name").await?);
        let lvs = parse_lvs(
            &self
                .report("lvs", "vg_name,lv_name,lv_path,lv_dm_path")
                .await?,
        );
        for pv in pvs.iter().filter(|pv| pv.vg_name.is_none()) {
            tracing::trace!("Orphan PV {}", pv.pv_name);
        }
        for lv in lvs.iter().filter(|lv| lv.lv_path.is_none()) {
            tracing::trace!("Hidden LV {}/{}", lv.vg_name, lv.lv_name);
        }
        tracing::debug!("LVM reports {} PV(s), {} LV(s)", pvs.len(), lvs.len());
        Ok(index(&pvs, &lvs))
    }

    /// Swap in a fresh identifier set, returning how many were added or removed.
    fn replace(&self, fresh: HashSet<String>) -> usize {
        let mut identifiers = self
            .identifiers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let added = fresh.difference(&identifiers).count();
        let removed = identifiers.difference(&fresh).count();
        *identifiers = fresh;
        added + removed
    }
}

impl DeviceRegistry for LvmInventory {
    fn contains(&self, identifier: &str) -> bool {
        self.identifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(identifier)
    }
}

#[async_trait]
impl InventoryLoader for LvmInventory {
    async fn load(&self, options: LoadOptions) -> storage_udevwatch::Result<usize> {
        if !options.refresh && self.loaded.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let fresh = self.query(options).await?;
        let total = fresh.len();
        let changes = self.replace(fresh);
        self.loaded.store(true, Ordering::SeqCst);

        if options.log {
            tracing::info!("LVM inventory loaded: {total} device node(s), {changes} change(s)");
        } else {
            tracing::debug!("LVM inventory loaded: {total} device node(s), {changes} change(s)");
        }

        if options.emit_signal && changes > 0 {
            self.generation.send_modify(|generation| *generation += 1);
        }

        Ok(changes)
    }
}
