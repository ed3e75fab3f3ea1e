//! The dendrogram-node state machine.
//!
//! Every node of the Berger-Rigoutsos decision tree is a cooperative state
//! machine distributed over its process group. A node interleaves local
//! histogram work with one collective at a time; [`continue_algorithm`]
//! advances a node as far as the arrived messages allow and returns the
//! phase it is waiting in. Nodes live in a per-run arena and refer to each
//! other through integer handles.

use tracing::{debug, trace};

use crate::comm::Exchange;
use crate::error::ClusterError;
use crate::geometry::{BoxId, IndexBox};
use crate::group::{CommGroup, Poll};
use crate::histogram::{choose_cut, TagHistogram};
use crate::patch::TagPatch;

use super::context::RunContext;
use super::wire::{Acceptability, ChildAssignment, ChildGroups, DropoutNotice, GroupingCriteria};
use super::OwnerMode;

/// Handle of a node in the run's arena.
pub(crate) type NodeHandle = usize;

/// Algorithmic phase of a dendrogram node.
///
/// Phases named after a collective mean the node has posted that
/// collective and waits for it. `WaitDropout` is the phase of an observer
/// stub on a rank that dropped out of the node's group at the parent's
/// split and only receives the final disposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    ToBeLaunched,
    ReduceHistogram,
    BcastAcceptability,
    GatherGroupingCriteria,
    BcastChildGroups,
    RunChildren,
    BcastToDropouts,
    WaitDropout,
    Completed,
}

/// Whether and how the candidate box was accepted.
///
/// Accepted codes are odd, rejected codes are even and non-negative; the
/// suffix records where the decision was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BoxAcceptance {
    Undetermined,
    HasNoTagByOwner,
    RejectedByCalculation,
    AcceptedByCalculation,
    RejectedByOwner,
    AcceptedByOwner,
    RejectedByRecombination,
    AcceptedByRecombination,
    RejectedByDropoutBcast,
    AcceptedByDropoutBcast,
}

impl BoxAcceptance {
    pub fn code(self) -> i32 {
        match self {
            BoxAcceptance::Undetermined => -2,
            BoxAcceptance::HasNoTagByOwner => -1,
            BoxAcceptance::RejectedByCalculation => 0,
            BoxAcceptance::AcceptedByCalculation => 1,
            BoxAcceptance::RejectedByOwner => 2,
            BoxAcceptance::AcceptedByOwner => 3,
            BoxAcceptance::RejectedByRecombination => 4,
            BoxAcceptance::AcceptedByRecombination => 5,
            BoxAcceptance::RejectedByDropoutBcast => 6,
            BoxAcceptance::AcceptedByDropoutBcast => 7,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ClusterError> {
        Ok(match code {
            -2 => BoxAcceptance::Undetermined,
            -1 => BoxAcceptance::HasNoTagByOwner,
            0 => BoxAcceptance::RejectedByCalculation,
            1 => BoxAcceptance::AcceptedByCalculation,
            2 => BoxAcceptance::RejectedByOwner,
            3 => BoxAcceptance::AcceptedByOwner,
            4 => BoxAcceptance::RejectedByRecombination,
            5 => BoxAcceptance::AcceptedByRecombination,
            6 => BoxAcceptance::RejectedByDropoutBcast,
            7 => BoxAcceptance::AcceptedByDropoutBcast,
            other => {
                return Err(ClusterError::invariant(format!(
                    "unknown acceptance code {other}"
                )))
            }
        })
    }

    pub fn is_accepted(self) -> bool {
        self.code() >= 0 && self.code() % 2 == 1
    }

    pub fn has_no_tag(self) -> bool {
        self.code() == -1
    }
}

/// Per-rank role in a node.
#[derive(Clone, Debug)]
pub(crate) enum Role {
    /// The rank is in the node's group and runs the full state machine.
    Participant,
    /// The rank dropped out at the parent's split; it only receives the
    /// dropout broadcast over the given member list.
    Observer { members: Vec<usize> },
}

/// One dendrogram node as seen by the local rank.
pub(crate) struct Node {
    /// Heap-style position in the binary tree: root is 1, children of
    /// position p are 2p and 2p+1.
    pub pos: i32,
    /// Tree depth, root is generation 1.
    pub generation: u32,
    pub parent: Option<NodeHandle>,
    pub left: Option<NodeHandle>,
    pub right: Option<NodeHandle>,
    /// Current candidate box; shrinks when the owner trims it to the tags.
    pub box_: IndexBox,
    /// Rank making the accept/split decision and owning any output box.
    pub owner: usize,
    /// Participating ranks, sorted.
    pub group: Vec<usize>,
    /// Message tag used by every collective of this node.
    pub mpi_tag: i32,
    pub phase: Phase,
    pub role: Role,
    pub acceptance: BoxAcceptance,
    /// Global tag count in the box, known group-wide after the
    /// acceptability broadcast.
    pub num_tags: i64,
    /// Child boxes chosen by the owner's cut, known after the
    /// acceptability broadcast of a rejected box.
    pub child_boxes: Option<(IndexBox, IndexBox)>,
    /// The collective currently in flight.
    pub comm: Option<CommGroup>,
    pub children_completed: u8,
    /// Output boxes produced by this subtree: 0, 1, or 2 for "more than
    /// one". Exactly one surviving box makes the subtree a recombination
    /// candidate at the parent.
    pub subtree_boxes: u8,
    /// The surviving box when `subtree_boxes == 1`.
    pub subtree_box: Option<(BoxId, IndexBox)>,
    /// Number of `continue_algorithm` calls, for statistics.
    pub n_continues: u32,
}

impl Node {
    fn new(pos: i32, generation: u32, box_: IndexBox, owner: usize, group: Vec<usize>) -> Self {
        Self {
            pos,
            generation,
            parent: None,
            left: None,
            right: None,
            box_,
            owner,
            group,
            mpi_tag: 0,
            phase: Phase::ToBeLaunched,
            role: Role::Participant,
            acceptance: BoxAcceptance::Undetermined,
            num_tags: 0,
            child_boxes: None,
            comm: None,
            children_completed: 0,
            subtree_boxes: 0,
            subtree_box: None,
            n_continues: 0,
        }
    }
}

/// Arena of the run's dendrogram nodes.
///
/// Nodes are never freed individually; handles stay valid for the whole
/// run, which keeps parent/child references trivial.
#[derive(Default)]
pub(crate) struct Arena {
    pub nodes: Vec<Node>,
}

impl Arena {
    pub fn alloc(&mut self, node: Node) -> NodeHandle {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Create and enqueue the root node spanning `bound_box` over all ranks.
pub(crate) fn launch_root<P: TagPatch>(
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    bound_box: IndexBox,
) -> Result<NodeHandle, ClusterError> {
    let group: Vec<usize> = (0..ctx.size).collect();
    let owner = 0;
    let mut root = Node::new(1, 1, bound_box, owner, group);

    // Every rank derives the root tag from the owner's pool base; the
    // owner also marks it claimed.
    root.mpi_tag = if ctx.rank == owner {
        ctx.tag_pool.claim()?
    } else {
        super::context::TagPool::first_tag_of(owner, ctx.size, ctx.tag_upper_bound)
    };

    let handle = arena.alloc(root);
    note_created(ctx, arena, handle);
    ctx.enqueue(handle);
    Ok(handle)
}

// Bookkeeping for a node materializing on this rank.
fn note_created<P: TagPatch>(ctx: &mut RunContext<'_, P>, arena: &Arena, h: NodeHandle) {
    let node = &arena.nodes[h];
    ctx.stats.live_nodes += 1;
    ctx.stats.max_nodes = ctx.stats.max_nodes.max(ctx.stats.live_nodes);
    ctx.stats.max_generation = ctx.stats.max_generation.max(node.generation);
    if matches!(node.role, Role::Participant) {
        ctx.nodes_active += 1;
        if node.owner == ctx.rank {
            ctx.nodes_owned += 1;
            ctx.stats.max_owned = ctx.stats.max_owned.max(ctx.nodes_owned);
        }
    }
}

// Ranks of the parent group that are not in this node's group. They learn
// the node's final disposition through the dropout broadcast.
fn dropouts_of(arena: &Arena, h: NodeHandle) -> Vec<usize> {
    let node = &arena.nodes[h];
    match node.parent {
        None => Vec::new(),
        Some(p) => arena.nodes[p]
            .group
            .iter()
            .copied()
            .filter(|r| !node.group.contains(r))
            .collect(),
    }
}

// Every rank holding this node's output box: the whole parent group (the
// node's participants plus its dropout observers), or the node's own group
// at the root.
fn holders_of(arena: &Arena, h: NodeHandle) -> Vec<usize> {
    let node = &arena.nodes[h];
    match node.parent {
        None => node.group.clone(),
        Some(p) => arena.nodes[p].group.clone(),
    }
}

// Total patch-cell overlap of the local patches with a box.
fn patch_overlap<P: TagPatch>(patches: &[P], target: &IndexBox) -> i64 {
    patches
        .iter()
        .map(|p| p.index_box().intersect(target).volume())
        .sum()
}

// Whether the owner mode gathers a load count besides the overlaps.
fn gathers_load(mode: OwnerMode) -> bool {
    matches!(mode, OwnerMode::FewestOwned | OwnerMode::LeastActive)
}

/// Advance the node as far as arrived messages allow.
///
/// Returns the phase the node is waiting in; [`Phase::Completed`] means
/// the node is done. The node registers itself on the stage whenever it
/// leaves a collective outstanding.
pub(crate) fn continue_algorithm<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<Phase, ClusterError> {
    arena.nodes[h].n_continues += 1;

    loop {
        match arena.nodes[h].phase {
            Phase::ToBeLaunched => start_reduce(h, arena, ctx, exchange)?,
            Phase::ReduceHistogram => {
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::ReduceHistogram);
                }
                finish_reduce(h, arena, ctx, exchange)?;
            }
            Phase::BcastAcceptability => {
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::BcastAcceptability);
                }
                finish_acceptability(h, arena, ctx, exchange)?;
            }
            Phase::GatherGroupingCriteria => {
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::GatherGroupingCriteria);
                }
                finish_gather(h, arena, ctx, exchange)?;
            }
            Phase::BcastChildGroups => {
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::BcastChildGroups);
                }
                finish_child_groups(h, arena, ctx)?;
            }
            Phase::RunChildren => {
                if arena.nodes[h].children_completed < 2 {
                    return Ok(Phase::RunChildren);
                }
                resolve_children(h, arena, ctx, exchange)?;
            }
            Phase::BcastToDropouts => {
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::BcastToDropouts);
                }
                complete_node(h, arena, ctx);
            }
            Phase::WaitDropout => {
                if arena.nodes[h].comm.is_none() {
                    post_dropout_recv(h, arena, ctx, exchange)?;
                }
                if !poll_comm(h, arena, ctx, exchange)? {
                    return Ok(Phase::WaitDropout);
                }
                finish_dropout_recv(h, arena, ctx)?;
            }
            Phase::Completed => return Ok(Phase::Completed),
        }
    }
}

// Poll the node's outstanding collective. Registers the node on the stage
// when the collective is still pending.
fn poll_comm<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<bool, ClusterError> {
    let comm = arena.nodes[h].comm.as_mut().expect("no collective posted");
    let done = comm.check(exchange)? == Poll::Complete;
    if !done {
        ctx.stage.register(h);
    }
    Ok(done)
}

// Drive the freshly posted collective to completion in synchronous mode.
fn sync_post<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    if ctx.stage.is_synchronous() {
        arena.nodes[h]
            .comm
            .as_mut()
            .expect("no collective posted")
            .complete(exchange)?;
    }
    Ok(())
}

// Build the local histogram and post the sum reduction to the owner.
fn start_reduce<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let node = &mut arena.nodes[h];
    trace!(pos = node.pos, box_ = %node.box_, "launching dendrogram node");

    // The local histogram only lives in the reduction buffer; whoever
    // needs the counts later holds the reduced version.
    let buf = TagHistogram::local(node.box_, ctx.patches, ctx.params.tag_val).to_buffer();

    let mut comm = CommGroup::new(node.group.clone(), node.owner, ctx.rank);
    comm.set_tag(node.mpi_tag);
    comm.begin_reduce_sum(exchange, buf)?;
    node.comm = Some(comm);
    node.phase = Phase::ReduceHistogram;
    sync_post(h, arena, ctx, exchange)
}

// The owner turns the reduced histogram into an accept/reject/no-tag
// decision and broadcasts it; other members join the broadcast empty.
fn finish_reduce<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let rank = ctx.rank;
    let params = ctx.params;
    let node = &mut arena.nodes[h];

    let payload = if node.owner == rank {
        let flat = node
            .comm
            .as_mut()
            .and_then(|c| c.take_result())
            .expect("owner missing reduction result");
        let mut hist = TagHistogram::from_buffer(node.box_, &flat);
        let num_tags = hist.num_tags();

        let mut box_ = node.box_;
        let mut child_boxes = None;
        let acceptance = if num_tags == 0 {
            BoxAcceptance::HasNoTagByOwner
        } else {
            // Shrink to the minimal bounding box of the tags before
            // deciding; the decision then applies to the shrunk box.
            let shrunk = hist.shrunk_to_tags(&params.min_box).expect("tags present");
            if shrunk != box_ {
                hist = hist.restrict(&shrunk);
                box_ = shrunk;
            }
            let efficiency = num_tags as f64 / box_.volume() as f64;
            let fits = box_.extents().all_le(&params.max_box_size);
            if efficiency >= params.efficiency_tol && fits {
                BoxAcceptance::AcceptedByCalculation
            } else {
                match choose_cut(
                    &hist,
                    &params.min_box,
                    &params.max_box_size,
                    params.max_lap_cut_from_center,
                ) {
                    Some(plan) => {
                        child_boxes = Some(box_.split_at(plan.dim, plan.cut));
                        BoxAcceptance::RejectedByCalculation
                    }
                    // No legal cut: keep the box rather than violate the
                    // advisory minimum size.
                    None => BoxAcceptance::AcceptedByCalculation,
                }
            }
        };
        debug!(
            pos = node.pos,
            num_tags,
            ?acceptance,
            box_ = %box_,
            "owner decision"
        );

        Some(
            Acceptability {
                acceptance,
                num_tags,
                box_,
                child_boxes,
            }
            .encode(),
        )
    } else {
        // Non-owners discard their reduction slot.
        let _ = node.comm.as_mut().and_then(|c| c.take_result());
        None
    };

    node.phase = Phase::BcastAcceptability;
    node.comm
        .as_mut()
        .expect("group missing")
        .begin_broadcast(exchange, payload)?;
    sync_post(h, arena, ctx, exchange)
}

// Unpack the owner's decision, then either record the output box, or
// compute the overlap contribution and post the grouping-criteria gather.
fn finish_acceptability<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let dim = ctx.dim;
    let rank = ctx.rank;

    let node = &mut arena.nodes[h];
    let payload = node
        .comm
        .as_mut()
        .and_then(|c| c.take_result())
        .expect("acceptability payload missing");

    let decision = Acceptability::decode(dim, &payload)?;
    let received = decision.acceptance;
    let num_tags = decision.num_tags;
    let box_ = decision.box_;

    node.num_tags = num_tags;
    node.box_ = box_;
    node.acceptance = if node.owner == rank {
        received
    } else if received.has_no_tag() {
        BoxAcceptance::HasNoTagByOwner
    } else if received.is_accepted() {
        BoxAcceptance::AcceptedByOwner
    } else {
        BoxAcceptance::RejectedByOwner
    };

    if node.pos == 1 {
        ctx.num_tags = num_tags;
    }

    if received.has_no_tag() {
        if node.pos != 1 {
            return Err(ClusterError::invariant(
                "child dendrogram node reduced to zero tags",
            ));
        }
        node.subtree_boxes = 0;
        return begin_dropout_bcast_or_complete(h, arena, ctx, exchange);
    }

    if received.is_accepted() {
        let id = BoxId {
            owner: node.owner,
            seq: node.pos,
        };
        node.subtree_boxes = 1;
        node.subtree_box = Some((id, box_));
        let holders = holders_of(arena, h);
        ctx.record_box(id, box_, holders);
        return begin_dropout_bcast_or_complete(h, arena, ctx, exchange);
    }

    // Rejected: the payload carries the two child boxes. Overlaps are
    // computed against the child boxes grown by the ghost width, so any
    // rank that could later hold a neighborhood relationship to a child's
    // output stays a participant.
    let Some((left, right)) = decision.child_boxes else {
        return Err(ClusterError::invariant("rejected box without child boxes"));
    };
    node.child_boxes = Some((left, right));

    let gcw = &ctx.params.ghost_cell_width;
    let clamp = |v: i64| v.min(i32::MAX as i64) as i32;
    let chunk = GroupingCriteria {
        left_overlap: clamp(patch_overlap(ctx.patches, &left.grow(gcw))),
        right_overlap: clamp(patch_overlap(ctx.patches, &right.grow(gcw))),
        load: match ctx.params.owner_mode {
            OwnerMode::FewestOwned => Some(ctx.nodes_owned as i32),
            OwnerMode::LeastActive => Some(ctx.nodes_active as i32),
            _ => None,
        },
    }
    .encode();

    node.phase = Phase::GatherGroupingCriteria;
    node.comm
        .as_mut()
        .expect("group missing")
        .begin_gather(exchange, chunk)?;
    sync_post(h, arena, ctx, exchange)
}

// The owner forms the child groups from the gathered overlaps, elects the
// child owners, claims two fresh tags and broadcasts the lot.
fn finish_gather<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let rank = ctx.rank;
    let mode = ctx.params.owner_mode;

    let payload = if arena.nodes[h].owner == rank {
        let criteria = arena.nodes[h]
            .comm
            .as_mut()
            .and_then(|c| c.take_result())
            .expect("owner missing gathered criteria");
        let chunk_len = GroupingCriteria::chunk_len(gathers_load(mode));
        let group = arena.nodes[h].group.clone();
        let (left_box, right_box) = arena.nodes[h].child_boxes.expect("split without cut");

        let mut sides = [
            (left_box, Vec::new(), Vec::new()),
            (right_box, Vec::new(), Vec::new()),
        ];
        for (index, chunk) in criteria.chunks_exact(chunk_len).enumerate() {
            let member = group[index];
            let criteria = GroupingCriteria::decode(chunk);
            let load = criteria.load.unwrap_or(0);
            let overlaps = [criteria.left_overlap, criteria.right_overlap];
            for (side, overlap) in sides.iter_mut().zip(overlaps) {
                if overlap > 0 {
                    side.1.push(member);
                    side.2.push((member, overlap, load));
                }
            }
        }

        // In single-owner mode the initial owner participates everywhere.
        if mode == OwnerMode::SingleOwner {
            let owner = arena.nodes[h].owner;
            for side in sides.iter_mut() {
                if let Err(at) = side.1.binary_search(&owner) {
                    side.1.insert(at, owner);
                }
            }
        }

        let owner = arena.nodes[h].owner;
        let pos = arena.nodes[h].pos;
        let mut assignments = Vec::with_capacity(2);
        for (side_box, side_group, candidates) in sides.iter() {
            if side_group.is_empty() {
                return Err(ClusterError::invariant(format!(
                    "empty child group after split of node {pos}"
                )));
            }
            let child_owner = match mode {
                OwnerMode::SingleOwner => owner,
                OwnerMode::MostOverlap => {
                    let mut best = (i32::MIN, usize::MAX);
                    for &(member, overlap, _) in candidates {
                        if overlap > best.0 {
                            best = (overlap, member);
                        }
                    }
                    best.1
                }
                OwnerMode::FewestOwned | OwnerMode::LeastActive => {
                    let mut best = (i32::MAX, usize::MAX);
                    for &(member, _, load) in candidates {
                        if load < best.0 {
                            best = (load, member);
                        }
                    }
                    best.1
                }
            };
            assignments.push(ChildAssignment {
                box_: *side_box,
                owner: child_owner,
                tag: ctx.tag_pool.claim()?,
                group: side_group.clone(),
            });
        }
        let right = assignments.pop().expect("two assignments built");
        let left = assignments.pop().expect("two assignments built");
        Some(ChildGroups { left, right }.encode())
    } else {
        let _ = arena.nodes[h].comm.as_mut().and_then(|c| c.take_result());
        None
    };

    let node = &mut arena.nodes[h];
    node.phase = Phase::BcastChildGroups;
    node.comm
        .as_mut()
        .expect("group missing")
        .begin_broadcast(exchange, payload)?;
    sync_post(h, arena, ctx, exchange)
}

// Instantiate the two children on every rank of the parent group, as a
// participant where the rank joins the child group and as a dropout
// observer otherwise, then suspend until both complete.
fn finish_child_groups<P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
) -> Result<(), ClusterError> {
    let dim = ctx.dim;
    let payload = arena.nodes[h]
        .comm
        .as_mut()
        .and_then(|c| c.take_result())
        .expect("child-groups payload missing");
    arena.nodes[h].comm = None;

    let parent_pos = arena.nodes[h].pos;
    if parent_pos > i32::MAX / 2 - 1 {
        return Err(ClusterError::invariant(format!(
            "dendrogram position overflow below node {parent_pos}"
        )));
    }
    let parent_group = arena.nodes[h].group.clone();
    let generation = arena.nodes[h].generation + 1;

    let groups = ChildGroups::decode(dim, &payload)?;
    let mut handles = [0; 2];
    for (side, assignment) in [groups.left, groups.right].into_iter().enumerate() {
        let child_pos = 2 * parent_pos + side as i32;
        let mut child = Node::new(
            child_pos,
            generation,
            assignment.box_,
            assignment.owner,
            assignment.group,
        );
        child.parent = Some(h);
        child.mpi_tag = assignment.tag;

        trace!(
            pos = child_pos,
            box_ = %child.box_,
            owner = child.owner,
            "child node created"
        );
        if child.group.contains(&ctx.rank) {
            child.role = Role::Participant;
        } else {
            // Dropout of this split: only listen for the disposition.
            let mut members: Vec<usize> = parent_group
                .iter()
                .copied()
                .filter(|r| !child.group.contains(r))
                .collect();
            if let Err(at) = members.binary_search(&child.owner) {
                members.insert(at, child.owner);
            }
            child.role = Role::Observer { members };
            child.phase = Phase::WaitDropout;
        }

        let handle = arena.alloc(child);
        note_created(ctx, arena, handle);
        handles[side] = handle;
    }

    let node = &mut arena.nodes[h];
    node.left = Some(handles[0]);
    node.right = Some(handles[1]);
    node.phase = Phase::RunChildren;

    ctx.enqueue_pair(handles[0], handles[1]);
    Ok(())
}

// With both children complete, decide recombination and wind the node
// down. The eligibility test uses only data every rank of the group holds
// (the broadcast tag count and the surviving child boxes), so all ranks
// reach the same verdict without another message.
fn resolve_children<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let params = ctx.params;
    let (lh, rh) = {
        let node = &arena.nodes[h];
        (
            node.left.expect("left child missing"),
            node.right.expect("right child missing"),
        )
    };
    let left_boxes = arena.nodes[lh].subtree_boxes;
    let right_boxes = arena.nodes[rh].subtree_boxes;

    let mut recombined = false;
    if left_boxes == 1 && right_boxes == 1 {
        let (left_id, left_box) = arena.nodes[lh].subtree_box.expect("left box missing");
        let (right_id, right_box) = arena.nodes[rh].subtree_box.expect("right box missing");
        let hull = left_box.hull(&right_box);
        let fits = hull.extents().all_le(&params.max_box_size);
        let efficiency = arena.nodes[h].num_tags as f64 / hull.volume() as f64;

        if fits && efficiency >= params.combine_tol * params.efficiency_tol {
            debug!(pos = arena.nodes[h].pos, hull = %hull, "recombining children");
            ctx.erase_box(&left_id);
            ctx.erase_box(&right_id);
            arena.nodes[lh].acceptance = BoxAcceptance::RejectedByRecombination;
            arena.nodes[rh].acceptance = BoxAcceptance::RejectedByRecombination;

            let id = BoxId {
                owner: arena.nodes[h].owner,
                seq: arena.nodes[h].pos,
            };
            let holders = holders_of(arena, h);
            ctx.record_box(id, hull, holders);

            let node = &mut arena.nodes[h];
            node.acceptance = BoxAcceptance::AcceptedByRecombination;
            node.subtree_boxes = 1;
            node.subtree_box = Some((id, hull));
            recombined = true;
        }
    }

    if !recombined {
        let surviving = arena.nodes[lh].subtree_box.or(arena.nodes[rh].subtree_box);
        let node = &mut arena.nodes[h];
        node.subtree_boxes = (left_boxes + right_boxes).min(2);
        if node.subtree_boxes == 1 {
            node.subtree_box = surviving;
        }
    }

    begin_dropout_bcast_or_complete(h, arena, ctx, exchange)
}

// The owner tells the split's dropouts the final disposition; everyone
// else is done at this point.
fn begin_dropout_bcast_or_complete<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let dropouts = dropouts_of(arena, h);
    let node = &mut arena.nodes[h];

    if node.owner != ctx.rank || dropouts.is_empty() {
        complete_node(h, arena, ctx);
        return Ok(());
    }

    let mut members = dropouts;
    if let Err(at) = members.binary_search(&node.owner) {
        members.insert(at, node.owner);
    }

    let msg = DropoutNotice {
        acceptance: node.acceptance,
        subtree_boxes: node.subtree_boxes,
        survivor: node.subtree_box,
    }
    .encode();

    let mut comm = CommGroup::new(members, node.owner, ctx.rank);
    comm.set_tag(node.mpi_tag);
    comm.begin_broadcast(exchange, Some(msg))?;
    node.comm = Some(comm);
    node.phase = Phase::BcastToDropouts;
    sync_post(h, arena, ctx, exchange)
}

// An observer stub posts its side of the dropout broadcast.
fn post_dropout_recv<E: Exchange, P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &RunContext<'_, P>,
    exchange: &E,
) -> Result<(), ClusterError> {
    let node = &mut arena.nodes[h];
    let members = match &node.role {
        Role::Observer { members } => members.clone(),
        Role::Participant => unreachable!("participant in dropout wait"),
    };
    let mut comm = CommGroup::new(members, node.owner, ctx.rank);
    comm.set_tag(node.mpi_tag);
    comm.begin_broadcast(exchange, None)?;
    node.comm = Some(comm);
    sync_post(h, arena, ctx, exchange)
}

// Record the disposition an observer stub received and finish.
fn finish_dropout_recv<P: TagPatch>(
    h: NodeHandle,
    arena: &mut Arena,
    ctx: &mut RunContext<'_, P>,
) -> Result<(), ClusterError> {
    let dim = ctx.dim;
    let node = &mut arena.nodes[h];
    let payload = node
        .comm
        .as_mut()
        .and_then(|c| c.take_result())
        .expect("dropout payload missing");

    let notice = DropoutNotice::decode(dim, &payload)?;
    node.acceptance = if notice.acceptance.is_accepted() {
        BoxAcceptance::AcceptedByDropoutBcast
    } else {
        BoxAcceptance::RejectedByDropoutBcast
    };
    node.subtree_boxes = notice.subtree_boxes;

    if let Some((id, box_)) = notice.survivor {
        node.subtree_box = Some((id, box_));
        let holders = holders_of(arena, h);
        ctx.record_box(id, box_, holders);
    }

    complete_node(h, arena, ctx);
    Ok(())
}

// Final bookkeeping: statistics, counters, and the completion signal to
// the parent. The parent relaunches once both its children signalled.
fn complete_node<P: TagPatch>(h: NodeHandle, arena: &mut Arena, ctx: &mut RunContext<'_, P>) {
    let node = &mut arena.nodes[h];
    node.phase = Phase::Completed;
    node.comm = None;
    trace!(pos = node.pos, acceptance = ?node.acceptance, "node completed");

    ctx.stats.completed_nodes += 1;
    ctx.stats.total_continues += node.n_continues as u64;
    ctx.stats.max_continues = ctx.stats.max_continues.max(node.n_continues);
    ctx.stats.live_nodes -= 1;
    if matches!(node.role, Role::Participant) {
        ctx.nodes_active -= 1;
        if node.owner == ctx.rank {
            ctx.nodes_owned -= 1;
        }
    }

    if let Some(p) = arena.nodes[h].parent {
        let parent = &mut arena.nodes[p];
        parent.children_completed += 1;
        if parent.children_completed == 2 {
            debug_assert_eq!(parent.phase, Phase::RunChildren);
            ctx.enqueue(p);
        }
    }
}
