/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration emission.
//!
//! Renders the affinity graph into flat, sourceable `KEY=VALUE` artifacts.
//! Global mode writes a single `nccl.env` covering all allocated adapters;
//! per-accelerator mode writes one `nccl-gpu<index>.env` per accelerator,
//! scoped to that accelerator's preferred adapters. Artifacts are always
//! rewritten whole; a failed write is the engine's only fatal error.
//!
//! The tuning scalars are fixed known-good defaults for the detected
//! transport class (RoCE v2 GID table index, GPU-direct level, NVLink
//! preference), not probed values.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::affinity::AffinityGraph;
use crate::inventory::Inventory;
use crate::inventory::NetworkAdapter;

/// Bootstrap interface substituted when an adapter's netdev name could not
/// be discovered.
pub const DEFAULT_BOOTSTRAP_IFNAME: &str = "eth0";

/// Interface selector for the RDMA-disabled configuration: plain TCP over
/// anything but loopback and the container bridge.
pub const TCP_FALLBACK_IFNAME: &str = "^lo,docker0";

/// Artifact file name written in global mode.
pub const GLOBAL_ARTIFACT: &str = "nccl.env";

/// Artifact file name written per accelerator in per-accelerator mode.
pub fn per_accelerator_artifact(index: u32) -> String {
    format!("nccl-gpu{}.env", index)
}

/// Emission mode, selected by caller intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// One configuration shared by every local process.
    Global,
    /// One configuration per accelerator index.
    PerAccelerator,
}

/// The only fatal error in the engine: the artifact could not be written.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write configuration artifact {}: {source}", .path.display())]
    WriteArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An ordered set of NCCL environment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcclConfig {
    entries: Vec<(String, String)>,
}

impl NcclConfig {
    /// RDMA configuration over the given adapters. `adapters` must be
    /// non-empty; the caller picks [`NcclConfig::rdma_disabled`] otherwise.
    pub fn rdma_enabled(adapters: &[&NetworkAdapter]) -> Self {
        let mut devices: Vec<&str> = Vec::new();
        let mut interfaces: Vec<&str> = Vec::new();
        for adapter in adapters {
            if !devices.contains(&adapter.low_level_id.as_str()) {
                devices.push(adapter.low_level_id.as_str());
            }
            let interface = if adapter.interface_name.is_empty() {
                DEFAULT_BOOTSTRAP_IFNAME
            } else {
                adapter.interface_name.as_str()
            };
            if !interfaces.contains(&interface) {
                interfaces.push(interface);
            }
        }

        let entries = vec![
            ("NCCL_IB_DISABLE".to_string(), "0".to_string()),
            ("NCCL_IB_HCA".to_string(), devices.join(",")),
            ("NCCL_SOCKET_IFNAME".to_string(), interfaces.join(",")),
            // RoCE v2 addressing.
            ("NCCL_IB_GID_INDEX".to_string(), "3".to_string()),
            // GPU-direct RDMA across the PCI switch hierarchy.
            ("NCCL_NET_GDR_LEVEL".to_string(), "5".to_string()),
            // Prefer NVLink for intra-host transfers.
            ("NCCL_P2P_LEVEL".to_string(), "NVL".to_string()),
            ("NCCL_CROSS_NIC".to_string(), "1".to_string()),
            ("NCCL_IB_TIMEOUT".to_string(), "22".to_string()),
            ("NCCL_MIN_NCHANNELS".to_string(), "4".to_string()),
        ];
        Self { entries }
    }

    /// TCP-only configuration used when no RDMA adapters are allocated.
    pub fn rdma_disabled() -> Self {
        let entries = vec![
            ("NCCL_IB_DISABLE".to_string(), "1".to_string()),
            (
                "NCCL_SOCKET_IFNAME".to_string(),
                TCP_FALLBACK_IFNAME.to_string(),
            ),
            ("NCCL_P2P_LEVEL".to_string(), "NVL".to_string()),
        ];
        Self { entries }
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Render as a flat, sourceable `KEY=VALUE` listing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Parse a rendered listing back into a configuration. Blank lines and
    /// `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let (key, value) = line.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        Self { entries }
    }
}

/// Write the configuration artifacts for the chosen mode into `out_dir`,
/// overwriting any prior artifacts. Returns the written paths.
pub fn emit(
    inventory: &Inventory,
    graph: &AffinityGraph,
    mode: EmitMode,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, EmitError> {
    fs::create_dir_all(out_dir).map_err(|source| EmitError::CreateDir {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    match mode {
        EmitMode::Global => {
            let config = config_for(graph.allocated_adapters(), &inventory.adapters);
            written.push(write_artifact(out_dir, GLOBAL_ARTIFACT, &config)?);
        }
        EmitMode::PerAccelerator => {
            for accelerator in &inventory.accelerators {
                let config =
                    config_for(graph.preferred_adapters(accelerator.index), &inventory.adapters);
                written.push(write_artifact(
                    out_dir,
                    &per_accelerator_artifact(accelerator.index),
                    &config,
                )?);
            }
        }
    }
    Ok(written)
}

/// Build the configuration for an ordered adapter-id list, resolving each id
/// back to its scanned record for the interface name.
fn config_for(ids: &[String], adapters: &[NetworkAdapter]) -> NcclConfig {
    let resolved: Vec<&NetworkAdapter> = ids
        .iter()
        .filter_map(|id| adapters.iter().find(|adapter| &adapter.low_level_id == id))
        .collect();
    if resolved.is_empty() {
        NcclConfig::rdma_disabled()
    } else {
        NcclConfig::rdma_enabled(&resolved)
    }
}

fn write_artifact(out_dir: &Path, name: &str, config: &NcclConfig) -> Result<PathBuf, EmitError> {
    let path = out_dir.join(name);
    fs::write(&path, config.render()).map_err(|source| EmitError::WriteArtifact {
        path: path.clone(),
        source,
    })?;
    tracing::info!(path = %path.display(), "wrote configuration artifact");
    Ok(path)
}
