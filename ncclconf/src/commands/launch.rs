/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use anyhow::Context;
use nccl_topo::EnvSnapshot;
use nccl_topo::SysPaths;
use nccl_topo::launch;

#[derive(clap::Args, Debug)]
pub struct LaunchCommand {
    /// Directory holding the emitted configuration artifacts.
    #[arg(long, default_value = "/run/nccl")]
    config_dir: PathBuf,

    /// GPU index for this process; falls back to $LOCAL_RANK, then 0.
    #[arg(long)]
    gpu_index: Option<u32>,

    /// Skip NUMA CPU/memory binding even when it would be available.
    #[arg(long)]
    no_bind: bool,

    /// Command to exec after applying the configuration.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

impl LaunchCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let paths = SysPaths::default();
        let env = EnvSnapshot::capture();
        let index = match self.gpu_index {
            Some(index) => index,
            None => match launch::local_rank(&env) {
                Some(index) => index,
                None => {
                    tracing::warn!(
                        "no --gpu-index and no {} in the environment, assuming GPU 0",
                        launch::LOCAL_RANK
                    );
                    0
                }
            },
        };

        let config = launch::select_config(&self.config_dir, index);
        let numa_node = if self.no_bind {
            None
        } else {
            // Queried live: accelerator-to-index binding can change between
            // launches, so the artifact is not trusted for NUMA placement.
            let node = launch::accelerator_numa_node(index, &paths);
            if node.is_none() {
                tracing::warn!(gpu = index, "NUMA node unknown, launching without binding");
            }
            node
        };

        let plan = launch::prepare(self.command, &config, numa_node)?;
        tracing::debug!(program = %plan.program, numa_node = ?plan.numa_node, "exec");
        let err = plan.exec();
        Err(anyhow::Error::new(err)).context("failed to exec target command")
    }
}
