/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Accelerator/adapter affinity graph.
//!
//! A pure function over the scanned inventory: every accelerator is paired
//! with every *allocated* adapter and the pair is classified by NUMA
//! locality. Each accelerator also gets a preferred adapter subset (its
//! NUMA-local adapters), degrading to the full allocated list when none are
//! local so that an accelerator always has some adapters to try.

use std::collections::HashMap;

use crate::inventory::Accelerator;
use crate::inventory::NetworkAdapter;
use crate::inventory::UNKNOWN_NUMA_NODE;

/// NUMA locality classification of one accelerator/adapter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCost {
    /// Both NUMA nodes known and equal.
    Local,
    /// Both NUMA nodes known and different.
    Remote,
    /// Either side's NUMA node is unknown.
    Unknown,
}

/// One (accelerator, allocated adapter) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityEdge {
    pub accelerator: u32,
    pub adapter: String,
    pub cost: LinkCost,
}

/// Complete bipartite graph over accelerators and allocated adapters.
#[derive(Debug, Clone, Default)]
pub struct AffinityGraph {
    edges: Vec<AffinityEdge>,
    /// Allocated adapter ids in discovery order.
    allocated: Vec<String>,
    /// Per-accelerator preferred subset, degrade-to-full already applied.
    preferred: HashMap<u32, Vec<String>>,
}

/// Classify one pair by NUMA node.
pub fn link_cost(accelerator_node: i32, adapter_node: i32) -> LinkCost {
    if accelerator_node == UNKNOWN_NUMA_NODE || adapter_node == UNKNOWN_NUMA_NODE {
        LinkCost::Unknown
    } else if accelerator_node == adapter_node {
        LinkCost::Local
    } else {
        LinkCost::Remote
    }
}

impl AffinityGraph {
    /// Build the graph. Unallocated adapters are not part of the graph at
    /// all; empty inputs yield an empty graph.
    pub fn build(accelerators: &[Accelerator], adapters: &[NetworkAdapter]) -> Self {
        let allocated: Vec<&NetworkAdapter> = adapters
            .iter()
            .filter(|adapter| adapter.allocated)
            .collect();
        let allocated_ids: Vec<String> = allocated
            .iter()
            .map(|adapter| adapter.low_level_id.clone())
            .collect();

        let mut edges = Vec::with_capacity(accelerators.len() * allocated.len());
        let mut preferred = HashMap::new();

        for accelerator in accelerators {
            let mut local = Vec::new();
            for adapter in &allocated {
                let cost = link_cost(accelerator.numa_node, adapter.numa_node);
                if cost == LinkCost::Local {
                    local.push(adapter.low_level_id.clone());
                }
                edges.push(AffinityEdge {
                    accelerator: accelerator.index,
                    adapter: adapter.low_level_id.clone(),
                    cost,
                });
            }
            if local.is_empty() {
                tracing::debug!(
                    accelerator = accelerator.index,
                    "no NUMA-local adapters, degrading to full allocated set"
                );
                local = allocated_ids.clone();
            }
            preferred.insert(accelerator.index, local);
        }

        Self {
            edges,
            allocated: allocated_ids,
            preferred,
        }
    }

    pub fn edges(&self) -> &[AffinityEdge] {
        &self.edges
    }

    /// Allocated adapter ids in discovery order.
    pub fn allocated_adapters(&self) -> &[String] {
        &self.allocated
    }

    /// Preferred adapters for one accelerator. Unknown indices fall back to
    /// the full allocated list, matching the degrade policy.
    pub fn preferred_adapters(&self, accelerator: u32) -> &[String] {
        self.preferred
            .get(&accelerator)
            .map(Vec::as_slice)
            .unwrap_or(&self.allocated)
    }
}
