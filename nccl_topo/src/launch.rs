/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-process launch support.
//!
//! Each spawned training process runs through the wrapper once: select the
//! configuration artifact for the process's accelerator, overlay it onto the
//! environment, optionally pin CPU/memory to the accelerator's NUMA node via
//! `numactl`, and replace the wrapper with the target command. NUMA binding
//! is an optimization and never blocks the launch; a missing artifact
//! degrades to the built-in RDMA-disabled configuration.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use anyhow::bail;
use which::which_in;

use crate::allocation::EnvSnapshot;
use crate::emit::GLOBAL_ARTIFACT;
use crate::emit::NcclConfig;
use crate::emit::per_accelerator_artifact;
use crate::inventory::SysPaths;
use crate::inventory::UNKNOWN_NUMA_NODE;
use crate::inventory::scan_accelerators;

/// Assembled command, argument vector, environment overlay and binding
/// decision; handed off in one explicit [`LaunchPlan::exec`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// NUMA node the process will be bound to, when binding applies.
    pub numa_node: Option<i32>,
}

impl LaunchPlan {
    /// Replace the current process image with the planned command. Only
    /// returns on failure.
    pub fn exec(self) -> std::io::Error {
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.exec()
    }
}

/// Environment variable set by common process launchers naming this
/// process's accelerator.
pub const LOCAL_RANK: &str = "LOCAL_RANK";

/// Accelerator index advertised by the launcher, if any.
pub fn local_rank(env: &EnvSnapshot) -> Option<u32> {
    env.get(LOCAL_RANK)?.parse().ok()
}

/// Select the configuration for one accelerator: per-accelerator artifact
/// first, then the global one, then the built-in RDMA-disabled fallback.
pub fn select_config(config_dir: &Path, accelerator: u32) -> NcclConfig {
    for name in [per_accelerator_artifact(accelerator), GLOBAL_ARTIFACT.to_string()] {
        let path = config_dir.join(&name);
        match fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "selected configuration artifact");
                return NcclConfig::parse(&text);
            }
            Err(_) => continue,
        }
    }
    tracing::warn!(
        dir = %config_dir.display(),
        "no configuration artifact found, using RDMA-disabled defaults"
    );
    NcclConfig::rdma_disabled()
}

/// Re-query the live system for one accelerator's NUMA node. The artifact is
/// not trusted for this: accelerator-to-index binding can change between
/// launches.
pub fn accelerator_numa_node(accelerator: u32, paths: &SysPaths) -> Option<i32> {
    scan_accelerators(paths)
        .into_iter()
        .find(|candidate| candidate.index == accelerator)
        .map(|candidate| candidate.numa_node)
        .filter(|node| *node != UNKNOWN_NUMA_NODE)
}

/// Build the launch plan. Binding is attempted only when the NUMA node is
/// known and `numactl` is on `PATH`; otherwise the command runs unbound.
pub fn prepare(
    command: Vec<String>,
    config: &NcclConfig,
    numa_node: Option<i32>,
) -> Result<LaunchPlan> {
    if command.is_empty() {
        bail!("no command given to launch");
    }

    let bind_node = match numa_node {
        Some(node) if find_in_path("numactl").is_some() => Some(node),
        Some(node) => {
            tracing::warn!(node, "numactl not found, launching without NUMA binding");
            None
        }
        None => None,
    };

    let (program, args) = bind_command(command, bind_node);
    Ok(LaunchPlan {
        program,
        args,
        env: config.entries().to_vec(),
        numa_node: bind_node,
    })
}

/// Prefix the command with the `numactl` CPU/memory pin when a node is
/// given. `command` must be non-empty.
fn bind_command(command: Vec<String>, node: Option<i32>) -> (String, Vec<String>) {
    match node {
        Some(node) => {
            let args = [
                format!("--cpunodebind={}", node),
                format!("--membind={}", node),
            ]
            .into_iter()
            .chain(command)
            .collect();
            ("numactl".to_string(), args)
        }
        None => {
            let mut parts = command.into_iter();
            let program = parts.next().expect("checked non-empty");
            (program, parts.collect())
        }
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH");
    search_path(binary, path.as_deref())
}

/// `which` honors the executable bit: a plain file named like the binary is
/// not a match.
fn search_path(binary: &str, path: Option<&OsStr>) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    which_in(binary, path, cwd).ok()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::affinity::AffinityGraph;
    use crate::emit::EmitMode;
    use crate::emit::emit;
    use crate::inventory::Accelerator;
    use crate::inventory::Inventory;
    use crate::inventory::NetworkAdapter;

    fn emitted_dir(mode: EmitMode) -> TempDir {
        let mut adapter = NetworkAdapter::new("mlx5_0", 0);
        adapter.interface_name = "net1".to_string();
        adapter.allocated = true;
        let inventory = Inventory {
            accelerators: vec![Accelerator {
                index: 0,
                numa_node: 0,
            }],
            adapters: vec![adapter],
        };
        let graph = AffinityGraph::build(&inventory.accelerators, &inventory.adapters);
        let out = TempDir::new().unwrap();
        emit(&inventory, &graph, mode, out.path()).unwrap();
        out
    }

    #[test]
    fn test_select_prefers_per_accelerator_artifact() {
        let out = emitted_dir(EmitMode::PerAccelerator);
        let config = select_config(out.path(), 0);
        assert_eq!(config.get("NCCL_IB_HCA"), Some("mlx5_0"));
    }

    #[test]
    fn test_select_falls_back_to_global() {
        let out = emitted_dir(EmitMode::Global);
        // Index 3 has no per-accelerator artifact.
        let config = select_config(out.path(), 3);
        assert_eq!(config.get("NCCL_IB_HCA"), Some("mlx5_0"));
    }

    #[test]
    fn test_select_falls_back_to_disabled() {
        let out = TempDir::new().unwrap();
        let config = select_config(out.path(), 0);
        assert_eq!(config.get("NCCL_IB_DISABLE"), Some("1"));
    }

    #[test]
    fn test_bind_command_with_node() {
        let (program, args) = bind_command(
            vec!["python".to_string(), "train.py".to_string()],
            Some(1),
        );
        assert_eq!(program, "numactl");
        assert_eq!(
            args,
            vec!["--cpunodebind=1", "--membind=1", "python", "train.py"]
        );
    }

    #[test]
    fn test_bind_command_without_node() {
        let (program, args) = bind_command(
            vec!["python".to_string(), "train.py".to_string()],
            None,
        );
        assert_eq!(program, "python");
        assert_eq!(args, vec!["train.py"]);
    }

    #[test]
    fn test_prepare_overlays_config_env() {
        let config = NcclConfig::rdma_disabled();
        let plan = prepare(vec!["true".to_string()], &config, None).unwrap();
        assert_eq!(plan.program, "true");
        assert!(plan
            .env
            .iter()
            .any(|(key, value)| key == "NCCL_IB_DISABLE" && value == "1"));
        assert_eq!(plan.numa_node, None);
    }

    #[test]
    fn test_prepare_rejects_empty_command() {
        let config = NcclConfig::rdma_disabled();
        assert!(prepare(vec![], &config, None).is_err());
    }

    #[test]
    fn test_local_rank_from_snapshot() {
        let env = EnvSnapshot::from_vars(vec![("LOCAL_RANK".to_string(), "3".to_string())]);
        assert_eq!(local_rank(&env), Some(3));
        assert_eq!(local_rank(&EnvSnapshot::default()), None);

        let env = EnvSnapshot::from_vars(vec![("LOCAL_RANK".to_string(), "gpu0".to_string())]);
        assert_eq!(local_rank(&env), None);
    }

    #[test]
    fn test_search_path_requires_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("numactl");
        fs::write(&binary, "").unwrap();
        // A non-executable file must not be selected; planning a numactl
        // prefix around it would turn the binding optimization into a
        // fatal exec.
        assert_eq!(search_path("numactl", Some(dir.path().as_os_str())), None);

        let mut perms = fs::metadata(&binary).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&binary, perms).unwrap();
        assert!(search_path("numactl", Some(dir.path().as_os_str())).is_some());
    }

    #[test]
    fn test_accelerator_numa_node_unknown_when_absent() {
        let root = TempDir::new().unwrap();
        let paths = SysPaths {
            pci_devices: root.path().join("pci"),
            infiniband: root.path().join("ib"),
            nvidia_gpus: root.path().join("gpus"),
        };
        assert_eq!(accelerator_numa_node(0, &paths), None);
    }
}
