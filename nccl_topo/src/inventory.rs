/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Device inventory scanning.
//!
//! Enumerates the accelerators and RDMA-capable network adapters present on
//! this host, together with the NUMA node of each. Every query is a local
//! file read or a short-lived tool invocation; a missing tool or file yields
//! an empty or unknown result, never an error.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use regex::Regex;

/// Sentinel NUMA node recorded when the node could not be determined.
pub const UNKNOWN_NUMA_NODE: i32 = -1;

/// Filesystem roots for the kernel-exposed topology sources consumed by the
/// scanner. Production code uses [`SysPaths::default`]; tests point these at
/// fixture directories.
#[derive(Debug, Clone)]
pub struct SysPaths {
    /// PCI device directory, normally `/sys/bus/pci/devices`.
    pub pci_devices: PathBuf,
    /// RDMA device class directory, normally `/sys/class/infiniband`.
    pub infiniband: PathBuf,
    /// NVIDIA driver procfs GPU directory, normally `/proc/driver/nvidia/gpus`.
    pub nvidia_gpus: PathBuf,
}

impl Default for SysPaths {
    fn default() -> Self {
        Self {
            pci_devices: PathBuf::from("/sys/bus/pci/devices"),
            infiniband: PathBuf::from("/sys/class/infiniband"),
            nvidia_gpus: PathBuf::from("/proc/driver/nvidia/gpus"),
        }
    }
}

/// One compute device, as ordered by the local accelerator driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accelerator {
    /// 0-based device index, matching the driver's ordering.
    pub index: u32,
    /// NUMA node, or [`UNKNOWN_NUMA_NODE`].
    pub numa_node: i32,
}

/// One RDMA-capable network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    /// Driver-level verbs device name, e.g. `mlx5_0`.
    pub low_level_id: String,
    /// Kernel network interface used for bootstrap traffic; empty when
    /// undiscoverable.
    pub interface_name: String,
    /// NUMA node, or [`UNKNOWN_NUMA_NODE`].
    pub numa_node: i32,
    /// Whether this adapter is assigned to the current process, as opposed
    /// to merely present on the host. Set by the allocation resolver.
    pub allocated: bool,
}

impl NetworkAdapter {
    pub fn new(low_level_id: impl Into<String>, numa_node: i32) -> Self {
        Self {
            low_level_id: low_level_id.into(),
            interface_name: String::new(),
            numa_node,
            allocated: false,
        }
    }
}

/// Snapshot of the devices present on this host at scan time.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub accelerators: Vec<Accelerator>,
    pub adapters: Vec<NetworkAdapter>,
}

/// Scan the live system for accelerators and RDMA adapters.
pub fn scan(paths: &SysPaths) -> Inventory {
    let inventory = Inventory {
        accelerators: scan_accelerators(paths),
        adapters: scan_adapters(paths),
    };
    tracing::info!(
        accelerators = inventory.accelerators.len(),
        adapters = inventory.adapters.len(),
        "device inventory scan complete"
    );
    inventory
}

/// Enumerate accelerators: `nvidia-smi` first, then the driver procfs.
/// Returns an empty list when neither source is available.
pub fn scan_accelerators(paths: &SysPaths) -> Vec<Accelerator> {
    if let Some(accelerators) = query_nvidia_smi(paths) {
        return accelerators;
    }
    tracing::debug!("nvidia-smi unavailable, falling back to driver procfs");
    scan_driver_procfs(paths)
}

/// Enumerate RDMA adapters from the infiniband device class, sorted by
/// device name for stable ordering across runs.
pub fn scan_adapters(paths: &SysPaths) -> Vec<NetworkAdapter> {
    let mut adapters = Vec::new();
    let entries = match fs::read_dir(&paths.infiniband) {
        Ok(entries) => entries,
        Err(_) => {
            tracing::debug!(
                path = %paths.infiniband.display(),
                "no RDMA device class directory"
            );
            return adapters;
        }
    };

    let mut sorted: Vec<_> = entries.flatten().collect();
    sorted.sort_by_key(|entry| entry.file_name());

    for entry in sorted {
        let name = entry.file_name().to_string_lossy().to_string();
        let numa_node = read_numa_node(&entry.path().join("device").join("numa_node"));
        adapters.push(NetworkAdapter::new(name, numa_node));
    }
    adapters
}

fn query_nvidia_smi(paths: &SysPaths) -> Option<Vec<Accelerator>> {
    // Older drivers do not know the numa.node query field; retry without it
    // and resolve NUMA through the PCI sysfs file instead.
    let (raw, has_numa_field) = match run_nvidia_smi("index,pci.bus_id,numa.node") {
        Some(raw) => (raw, true),
        None => (run_nvidia_smi("index,pci.bus_id")?, false),
    };

    let mut accelerators = Vec::new();
    for gpu in parse_smi_gpus(&raw, has_numa_field) {
        let numa_node = gpu
            .numa_node
            .filter(|node| *node >= 0)
            .or_else(|| pci_numa_node(paths, &gpu.pci_address))
            .unwrap_or(UNKNOWN_NUMA_NODE);
        accelerators.push(Accelerator {
            index: gpu.index,
            numa_node,
        });
    }
    accelerators.sort_by_key(|accelerator| accelerator.index);
    Some(accelerators)
}

fn run_nvidia_smi(fields: &str) -> Option<String> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu")
        .arg(fields)
        .arg("--format=csv,noheader")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, PartialEq, Eq)]
struct SmiGpu {
    index: u32,
    pci_address: String,
    numa_node: Option<i32>,
}

/// Parse `nvidia-smi --query-gpu` CSV output. Lines that do not parse are
/// skipped rather than failing the whole scan.
fn parse_smi_gpus(raw: &str, has_numa_field: bool) -> Vec<SmiGpu> {
    let mut gpus = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            continue;
        }
        let index = match fields[0].parse::<u32>() {
            Ok(index) => index,
            Err(_) => continue,
        };
        // "N/A", "[N/A]" and friends all fail the numeric parse and leave
        // the node to the sysfs fallback.
        let numa_node = if has_numa_field {
            fields.get(2).and_then(|field| field.parse::<i32>().ok())
        } else {
            None
        };
        gpus.push(SmiGpu {
            index,
            pci_address: normalize_pci_address(fields[1]),
            numa_node,
        });
    }
    gpus
}

/// Normalize a management-tool PCI address (8-hex-digit domain, upper case)
/// to the 4-digit lower-case form used under `/sys/bus/pci/devices`.
pub(crate) fn normalize_pci_address(address: &str) -> String {
    let address = address.trim().to_ascii_lowercase();
    let parts: Vec<&str> = address.split(':').collect();
    match parts.as_slice() {
        [domain, bus, rest] => {
            let domain = if domain.len() > 4 {
                &domain[domain.len() - 4..]
            } else {
                domain
            };
            format!("{:0>4}:{}:{}", domain, bus, rest)
        }
        _ => address,
    }
}

/// Fallback accelerator enumeration from `/proc/driver/nvidia/gpus`, keyed
/// on the per-device `Device Minor` field.
fn scan_driver_procfs(paths: &SysPaths) -> Vec<Accelerator> {
    let mut accelerators = Vec::new();
    let entries = match fs::read_dir(&paths.nvidia_gpus) {
        Ok(entries) => entries,
        Err(_) => return accelerators,
    };

    let minor_regex = Regex::new(r"Device Minor:\s*(\d+)").unwrap();
    for entry in entries.flatten() {
        let pci_address = entry.file_name().to_string_lossy().to_lowercase();
        let info_file = entry.path().join("information");
        let content = match fs::read_to_string(&info_file) {
            Ok(content) => content,
            Err(_) => continue,
        };
        let index = match minor_regex
            .captures(&content)
            .and_then(|captures| captures.get(1).unwrap().as_str().parse::<u32>().ok())
        {
            Some(index) => index,
            None => continue,
        };
        let numa_node = pci_numa_node(paths, &pci_address).unwrap_or(UNKNOWN_NUMA_NODE);
        accelerators.push(Accelerator { index, numa_node });
    }
    accelerators.sort_by_key(|accelerator| accelerator.index);
    accelerators
}

/// Read the NUMA node of a PCI device from its sysfs topology file.
/// Negative values (the kernel's own "unknown") map to `None`.
fn pci_numa_node(paths: &SysPaths, pci_address: &str) -> Option<i32> {
    let numa_file = paths.pci_devices.join(pci_address).join("numa_node");
    fs::read_to_string(numa_file)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|node| *node >= 0)
}

fn read_numa_node(path: &Path) -> i32 {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok())
        .filter(|node| *node >= 0)
        .unwrap_or(UNKNOWN_NUMA_NODE)
}
