/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Allocation resolution: which of the discovered RDMA adapters does this
//! process actually own?
//!
//! Container sandboxes receive a subset of the host's adapters, and the
//! subset is not knowable at image-build time. Three detection strategies
//! run in order, first success wins, partial results are never mixed:
//!
//! 1. Device-plugin metadata: orchestrators inject one `PCIDEVICE_*_INFO`
//!    environment variable per granted resource, a JSON object whose entries
//!    carry the granted verbs device name. When present, this list is
//!    authoritative and *replaces* the scanner's view.
//! 2. SR-IOV marker: an adapter whose device directory carries a `physfn`
//!    link is a virtual function assigned into this sandbox.
//! 3. Fail open: assume a bare-metal host and mark everything allocated,
//!    with a warning. Callers can distinguish this lower-confidence result
//!    via [`AllocationConfidence::AssumedAll`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;

use serde::Deserialize;

use crate::inventory::NetworkAdapter;
use crate::inventory::SysPaths;
use crate::inventory::UNKNOWN_NUMA_NODE;

/// Environment variable naming convention used by the SR-IOV network device
/// plugin for per-resource allocation metadata.
pub const DEVICE_PLUGIN_PREFIX: &str = "PCIDEVICE_";
pub const DEVICE_PLUGIN_SUFFIX: &str = "_INFO";

/// How the allocated adapter set was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationConfidence {
    /// Authoritative orchestrator metadata named the granted adapters.
    Metadata,
    /// Inferred from SR-IOV virtual-function markers on the adapters.
    SriovMarker,
    /// No evidence either way; every discovered adapter was assumed usable.
    AssumedAll,
}

/// Immutable snapshot of the process environment, captured once per run and
/// passed explicitly so that no component re-reads the live environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: Vec<(String, String)>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs (used by tests).
    pub fn from_vars(vars: Vec<(String, String)>) -> Self {
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

/// Resolve the allocated adapter subset, updating `allocated` flags in
/// place. Adapters named by metadata but invisible to the scanner are
/// appended, since the metadata is authoritative over sysfs visibility.
pub fn resolve(
    adapters: &mut Vec<NetworkAdapter>,
    env: &EnvSnapshot,
    paths: &SysPaths,
) -> AllocationConfidence {
    let granted = granted_device_names(env);
    if !granted.is_empty() {
        for adapter in adapters.iter_mut() {
            adapter.allocated = granted.contains(&adapter.low_level_id);
        }
        for name in &granted {
            if !adapters.iter().any(|adapter| &adapter.low_level_id == name) {
                tracing::info!(
                    device = %name,
                    "allocated adapter not visible in sysfs, trusting device-plugin metadata"
                );
                let mut adapter = NetworkAdapter::new(name.clone(), UNKNOWN_NUMA_NODE);
                adapter.allocated = true;
                adapters.push(adapter);
            }
        }
        tracing::info!(granted = granted.len(), "allocation resolved from device-plugin metadata");
        return AllocationConfidence::Metadata;
    }

    let mut marked = 0;
    for adapter in adapters.iter_mut() {
        if has_physfn_marker(paths, &adapter.low_level_id) {
            adapter.allocated = true;
            marked += 1;
        }
    }
    if marked > 0 {
        tracing::info!(marked, "allocation resolved from SR-IOV virtual-function markers");
        return AllocationConfidence::SriovMarker;
    }

    tracing::warn!(
        adapters = adapters.len(),
        "no allocation metadata or SR-IOV markers found, assuming all discovered adapters are usable"
    );
    for adapter in adapters.iter_mut() {
        adapter.allocated = true;
    }
    AllocationConfidence::AssumedAll
}

/// One device entry of a `PCIDEVICE_*_INFO` metadata blob, keyed by PCI
/// address. Only the RDMA section matters here; everything else in the blob
/// is ignored.
#[derive(Debug, Deserialize)]
struct DeviceInfo {
    rdma: Option<RdmaInfo>,
}

#[derive(Debug, Deserialize)]
struct RdmaInfo {
    rdma_device: Option<String>,
}

/// Union of verbs device names granted by all `PCIDEVICE_*_INFO` variables.
fn granted_device_names(env: &EnvSnapshot) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for (key, value) in env.iter() {
        if !key.starts_with(DEVICE_PLUGIN_PREFIX) || !key.ends_with(DEVICE_PLUGIN_SUFFIX) {
            continue;
        }
        let devices: BTreeMap<String, DeviceInfo> = match serde_json::from_str(value) {
            Ok(devices) => devices,
            Err(err) => {
                tracing::warn!(var = %key, error = %err, "unparseable device-plugin metadata, ignoring");
                continue;
            }
        };
        for info in devices.into_values() {
            if let Some(name) = info.rdma.and_then(|rdma| rdma.rdma_device) {
                names.insert(name);
            }
        }
    }
    names
}

/// A `physfn` entry under the adapter's device directory marks an SR-IOV
/// virtual function. `symlink_metadata` detects the link without following
/// it, since the target lives outside the sandbox's view.
fn has_physfn_marker(paths: &SysPaths, device: &str) -> bool {
    let marker = paths.infiniband.join(device).join("device").join("physfn");
    fs::symlink_metadata(marker).is_ok()
}
