/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shared sysfs/procfs fixture helpers for unit tests.

use std::fs;

use tempfile::TempDir;

use crate::inventory::SysPaths;

/// Build a `SysPaths` rooted in a temp directory, with all three source
/// directories present but empty.
pub(crate) fn fixture_paths(root: &TempDir) -> SysPaths {
    let paths = SysPaths {
        pci_devices: root.path().join("sys/bus/pci/devices"),
        infiniband: root.path().join("sys/class/infiniband"),
        nvidia_gpus: root.path().join("proc/driver/nvidia/gpus"),
    };
    fs::create_dir_all(&paths.pci_devices).unwrap();
    fs::create_dir_all(&paths.infiniband).unwrap();
    fs::create_dir_all(&paths.nvidia_gpus).unwrap();
    paths
}

/// Add an RDMA adapter fixture under the infiniband class directory.
pub(crate) fn add_adapter(paths: &SysPaths, name: &str, numa_node: Option<i32>) {
    let device_dir = paths.infiniband.join(name).join("device");
    fs::create_dir_all(&device_dir).unwrap();
    if let Some(node) = numa_node {
        fs::write(device_dir.join("numa_node"), format!("{}\n", node)).unwrap();
    }
}

/// Add a GPU fixture under the driver procfs directory, with an optional
/// PCI sysfs NUMA file.
pub(crate) fn add_gpu(paths: &SysPaths, pci_address: &str, minor: u32, numa_node: Option<i32>) {
    let gpu_dir = paths.nvidia_gpus.join(pci_address);
    fs::create_dir_all(&gpu_dir).unwrap();
    fs::write(
        gpu_dir.join("information"),
        format!("Model: Test GPU\nDevice Minor: \t {}\n", minor),
    )
    .unwrap();
    if let Some(node) = numa_node {
        let pci_dir = paths.pci_devices.join(pci_address);
        fs::create_dir_all(&pci_dir).unwrap();
        fs::write(pci_dir.join("numa_node"), format!("{}\n", node)).unwrap();
    }
}
