//! Shared state of one clustering run.
//!
//! Everything the dendrogram nodes coordinate through lives in a single
//! per-run context passed explicitly into every operation: the relaunch
//! queue, the stage, the message-tag pool, the output accumulators and
//! the statistics counters. No process-wide mutable state exists.

use std::collections::{BTreeMap, VecDeque};

use crate::error::ClusterError;
use crate::geometry::{BoxId, IndexBox};
use crate::patch::TagPatch;
use crate::stage::CommStage;

use super::node::NodeHandle;
use super::{ClusterParameters, RunStatistics};

/// Reserved tag for relationship messages; collective tags start above it.
pub(crate) const RELATIONSHIP_TAG: i32 = 0;

/// This rank's slice of the message-tag space.
///
/// The usable tag range is partitioned a priori among the ranks so that a
/// tag claimed by one process can never collide with a tag claimed by
/// another. Tags are never reused within a run.
pub(crate) struct TagPool {
    next: i32,
    last: i32,
    pool_size: i32,
}

impl TagPool {
    /// Partition the tag range `[1, upper_bound]` and return the pool of
    /// `rank`.
    pub fn partition(rank: usize, size: usize, upper_bound: i32) -> Self {
        let per_rank = upper_bound / size as i32;
        let first = 1 + rank as i32 * per_rank;
        Self {
            next: first,
            last: first + (per_rank - 1),
            pool_size: per_rank,
        }
    }

    /// First tag of the pool owned by `rank`.
    pub fn first_tag_of(rank: usize, size: usize, upper_bound: i32) -> i32 {
        1 + rank as i32 * (upper_bound / size as i32)
    }

    /// Claim a fresh tag.
    pub fn claim(&mut self) -> Result<i32, ClusterError> {
        if self.next > self.last {
            return Err(ClusterError::TagPoolExhausted {
                claimed: self.pool_size,
                pool_size: self.pool_size,
            });
        }
        let tag = self.next;
        self.next += 1;
        Ok(tag)
    }
}

/// An output box known to this rank, with the ranks that also know it.
#[derive(Clone, Debug)]
pub(crate) struct VisibleBox {
    pub box_: IndexBox,
    pub holders: Vec<usize>,
}

/// Statistics counters maintained while the dendrogram runs.
#[derive(Default)]
pub(crate) struct StatCounters {
    pub live_nodes: usize,
    pub max_nodes: usize,
    pub max_generation: u32,
    pub max_owned: usize,
    pub boxes_generated: usize,
    pub total_continues: u64,
    pub completed_nodes: u64,
    pub max_continues: u32,
}

/// Cross-node shared context of a run.
pub(crate) struct RunContext<'a, P: TagPatch> {
    pub params: &'a ClusterParameters,
    pub patches: &'a [P],
    pub dim: usize,
    pub rank: usize,
    pub size: usize,
    /// FIFO of nodes ready for their next poll.
    pub relaunch: VecDeque<NodeHandle>,
    pub stage: CommStage,
    pub tag_pool: TagPool,
    /// Resolved message-tag upper bound used to partition the pools.
    pub tag_upper_bound: i32,
    /// Every output box this rank participated in or observed.
    pub visible: BTreeMap<BoxId, VisibleBox>,
    /// Dendrogram nodes currently owned by this rank.
    pub nodes_owned: usize,
    /// Dendrogram nodes this rank currently participates in.
    pub nodes_active: usize,
    /// Global tag count, learned from the root acceptability broadcast.
    pub num_tags: i64,
    pub stats: StatCounters,
}

impl<'a, P: TagPatch> RunContext<'a, P> {
    /// Queue a node for its next poll. Synchronous runs push to the front
    /// so the dendrogram is walked depth first, which keeps the blocking
    /// collectives of overlapping sibling groups in a consistent global
    /// order.
    pub fn enqueue(&mut self, handle: NodeHandle) {
        if self.stage.is_synchronous() {
            self.relaunch.push_front(handle);
        } else {
            self.relaunch.push_back(handle);
        }
    }

    /// Queue a freshly spawned left/right pair so that the left child is
    /// polled first in either scheduling mode.
    pub fn enqueue_pair(&mut self, left: NodeHandle, right: NodeHandle) {
        if self.stage.is_synchronous() {
            self.relaunch.push_front(right);
            self.relaunch.push_front(left);
        } else {
            self.relaunch.push_back(left);
            self.relaunch.push_back(right);
        }
    }

    /// Record a newly visible output box.
    pub fn record_box(&mut self, id: BoxId, box_: IndexBox, holders: Vec<usize>) {
        tracing::debug!(?id, %box_, "output box recorded");
        if self
            .visible
            .insert(id, VisibleBox { box_, holders })
            .is_none()
        {
            self.stats.boxes_generated += 1;
        }
    }

    /// Drop a box erased by recombination.
    pub fn erase_box(&mut self, id: &BoxId) {
        tracing::debug!(?id, "output box erased by recombination");
        if self.visible.remove(id).is_some() {
            self.stats.boxes_generated -= 1;
        }
    }

    /// Fold the counters into the public statistics struct.
    pub fn statistics(&self) -> RunStatistics {
        RunStatistics {
            num_tags: self.num_tags,
            boxes_generated: self.stats.boxes_generated,
            max_nodes: self.stats.max_nodes,
            max_generation: self.stats.max_generation,
            max_owned: self.stats.max_owned,
            max_continues: self.stats.max_continues,
            avg_continues: if self.stats.completed_nodes == 0 {
                0.0
            } else {
                self.stats.total_continues as f64 / self.stats.completed_nodes as f64
            },
        }
    }
}
