/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use nccl_topo::AffinityGraph;
use nccl_topo::AllocationConfidence;
use nccl_topo::EmitMode;
use nccl_topo::EnvSnapshot;
use nccl_topo::SysPaths;
use nccl_topo::allocation;
use nccl_topo::emit;
use nccl_topo::inventory;
use nccl_topo::netdev;

#[derive(clap::Args, Debug)]
pub struct EmitCommand {
    /// Directory that receives the configuration artifacts.
    #[arg(long, default_value = "/run/nccl")]
    output_dir: PathBuf,

    /// Emission mode: one shared configuration, or one per GPU.
    #[arg(long, value_enum, default_value_t = Mode::Global)]
    mode: Mode,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Mode {
    /// A single configuration applied identically to every local process.
    Global,
    /// One configuration per GPU, scoped to its NUMA-local adapters.
    PerGpu,
}

impl EmitCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let paths = SysPaths::default();
        let env = EnvSnapshot::capture();

        let mut inventory = inventory::scan(&paths);
        let confidence = allocation::resolve(&mut inventory.adapters, &env, &paths);
        if confidence == AllocationConfidence::AssumedAll && !inventory.adapters.is_empty() {
            tracing::warn!(
                "adapter allocation was assumed, not confirmed; verify RDMA reachability before \
                 relying on this configuration"
            );
        }
        netdev::resolve_interfaces(&mut inventory.adapters, &paths);

        let graph = AffinityGraph::build(&inventory.accelerators, &inventory.adapters);
        let mode = match self.mode {
            Mode::Global => EmitMode::Global,
            Mode::PerGpu => EmitMode::PerAccelerator,
        };

        // The write is the only fatal step; everything above degrades.
        let written = emit::emit(&inventory, &graph, mode, &self.output_dir)?;
        for path in &written {
            println!("{}", path.display());
        }
        tracing::info!(
            accelerators = inventory.accelerators.len(),
            allocated = graph.allocated_adapters().len(),
            artifacts = written.len(),
            "configuration emitted"
        );
        Ok(())
    }
}
