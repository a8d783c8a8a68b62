/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Adapter-to-interface mapping.
//!
//! NCCL bootstraps over an ordinary kernel network interface before RDMA
//! traffic starts, so each verbs device needs its corresponding netdev name.
//! Primary source is the `ibdev2netdev` utility; the fallback walks the
//! adapter's own `device/net/` directory. Total failure leaves the name
//! empty and the emitter substitutes a default.

use std::collections::HashMap;
use std::fs;
use std::process::Command;

use regex::Regex;

use crate::inventory::NetworkAdapter;
use crate::inventory::SysPaths;

/// Fill in empty `interface_name`s for allocated adapters.
pub fn resolve_interfaces(adapters: &mut [NetworkAdapter], paths: &SysPaths) {
    let translated = query_ibdev2netdev();
    for adapter in adapters.iter_mut() {
        if !adapter.allocated || !adapter.interface_name.is_empty() {
            continue;
        }
        if let Some(interface) = translated.get(&adapter.low_level_id) {
            adapter.interface_name = interface.clone();
            continue;
        }
        match netdev_from_sysfs(paths, &adapter.low_level_id) {
            Some(interface) => adapter.interface_name = interface,
            None => {
                tracing::debug!(
                    device = %adapter.low_level_id,
                    "no netdev mapping found"
                );
            }
        }
    }
}

fn query_ibdev2netdev() -> HashMap<String, String> {
    let output = match Command::new("ibdev2netdev").output() {
        Ok(output) if output.status.success() => output,
        _ => return HashMap::new(),
    };
    parse_ibdev2netdev(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `ibdev2netdev` output lines of the form
/// `mlx5_0 port 1 ==> eth2 (Up)`.
fn parse_ibdev2netdev(raw: &str) -> HashMap<String, String> {
    let line_regex = Regex::new(r"(?m)^(\S+)\s+port\s+\d+\s+==>\s+(\S+)").unwrap();
    let mut map = HashMap::new();
    for captures in line_regex.captures_iter(raw) {
        let device = captures.get(1).unwrap().as_str().to_string();
        let interface = captures.get(2).unwrap().as_str().to_string();
        // First port wins; multi-port adapters share the netdev for
        // bootstrap purposes.
        map.entry(device).or_insert(interface);
    }
    map
}

/// First (sorted) entry of the adapter's `device/net/` directory.
fn netdev_from_sysfs(paths: &SysPaths, device: &str) -> Option<String> {
    let net_dir = paths.infiniband.join(device).join("device").join("net");
    let mut names: Vec<String> = fs::read_dir(net_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names.into_iter().next()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::inventory::scan_adapters;
    use crate::test_support::add_adapter;
    use crate::test_support::fixture_paths;

    #[test]
    fn test_parse_ibdev2netdev() {
        let raw = "mlx5_0 port 1 ==> eth2 (Up)\n\
                   mlx5_1 port 1 ==> eth3 (Down)\n\
                   mlx5_1 port 2 ==> eth4 (Up)\n";
        let map = parse_ibdev2netdev(raw);
        assert_eq!(map.get("mlx5_0").map(String::as_str), Some("eth2"));
        assert_eq!(map.get("mlx5_1").map(String::as_str), Some("eth3"));
    }

    #[test]
    fn test_parse_ibdev2netdev_garbage() {
        assert!(parse_ibdev2netdev("no devices here\n").is_empty());
        assert!(parse_ibdev2netdev("").is_empty());
    }

    #[test]
    fn test_sysfs_fallback() {
        let root = TempDir::new().unwrap();
        let paths = fixture_paths(&root);
        add_adapter(&paths, "mlx5_0", Some(0));
        let net_dir = paths.infiniband.join("mlx5_0").join("device").join("net");
        fs::create_dir_all(net_dir.join("net1")).unwrap();

        let mut adapters = scan_adapters(&paths);
        adapters[0].allocated = true;
        resolve_interfaces(&mut adapters, &paths);
        assert_eq!(adapters[0].interface_name, "net1");
    }

    #[test]
    fn test_sysfs_fallback_takes_first_sorted() {
        let root = TempDir::new().unwrap();
        let paths = fixture_paths(&root);
        add_adapter(&paths, "mlx5_0", Some(0));
        let net_dir = paths.infiniband.join("mlx5_0").join("device").join("net");
        fs::create_dir_all(net_dir.join("net2")).unwrap();
        fs::create_dir_all(net_dir.join("net1")).unwrap();

        assert_eq!(
            netdev_from_sysfs(&paths, "mlx5_0"),
            Some("net1".to_string())
        );
    }

    #[test]
    fn test_unallocated_adapters_skipped() {
        let root = TempDir::new().unwrap();
        let paths = fixture_paths(&root);
        add_adapter(&paths, "mlx5_0", Some(0));
        let net_dir = paths.infiniband.join("mlx5_0").join("device").join("net");
        fs::create_dir_all(net_dir.join("net1")).unwrap();

        let mut adapters = scan_adapters(&paths);
        resolve_interfaces(&mut adapters, &paths);
        assert!(adapters[0].interface_name.is_empty());
    }

    #[test]
    fn test_total_failure_leaves_empty() {
        let root = TempDir::new().unwrap();
        let paths = fixture_paths(&root);
        add_adapter(&paths, "mlx5_0", Some(0));

        let mut adapters = scan_adapters(&paths);
        adapters[0].allocated = true;
        resolve_interfaces(&mut adapters, &paths);
        assert!(adapters[0].interface_name.is_empty());
    }
}
