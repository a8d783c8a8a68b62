/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hardware topology auto-detection and NCCL configuration synthesis.
//!
//! This crate determines, for the accelerators and RDMA-capable network
//! adapters present on a machine, which adapter each accelerator should
//! prefer for inter-node communication, and renders the result as a runnable
//! NCCL environment configuration.
//!
//! The pipeline, in dependency order:
//! - [`inventory`]: enumerate accelerators and RDMA adapters with their NUMA
//!   nodes.
//! - [`allocation`]: narrow the adapter set to what this container was
//!   actually granted (device-plugin metadata, SR-IOV markers, or the
//!   fail-open bare-metal assumption).
//! - [`netdev`]: map each RDMA device to the kernel network interface used
//!   for bootstrap traffic.
//! - [`affinity`]: classify every accelerator/adapter pair as NUMA-local or
//!   remote and compute per-accelerator preferred adapter sets.
//! - [`emit`]: write the configuration artifacts (one global file, or one
//!   file per accelerator).
//! - [`launch`]: per-process wrapper support; selects the artifact for one
//!   accelerator, optionally binds NUMA affinity, and execs the target.
//!
//! Every probe is read-only and degrades to an empty or unknown result when
//! its data source is missing; the artifact write is the only fatal error.

pub mod affinity;
pub mod allocation;
pub mod emit;
pub mod inventory;
pub mod launch;
pub mod netdev;

#[cfg(test)]
mod test_support;

pub use affinity::AffinityEdge;
pub use affinity::AffinityGraph;
pub use affinity::LinkCost;
pub use allocation::AllocationConfidence;
pub use allocation::EnvSnapshot;
pub use emit::EmitError;
pub use emit::EmitMode;
pub use emit::NcclConfig;
pub use inventory::Accelerator;
pub use inventory::Inventory;
pub use inventory::NetworkAdapter;
pub use inventory::SysPaths;
pub use inventory::UNKNOWN_NUMA_NODE;
pub use launch::LaunchPlan;
