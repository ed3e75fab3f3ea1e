//! Asynchronous distributed Berger-Rigoutsos clustering.
//!
//! Given a tag field distributed over the ranks of an exchange, the engine
//! covers the tagged cells with axis-aligned boxes subject to an
//! efficiency criterion and optionally computes neighborhood relationships
//! between the input tag boxes and the output boxes.
//!
//! The unit of work is a dendrogram node: a candidate box, a process
//! group and an owner elected within the group. Nodes either accept their
//! box or split it and spawn two children on sub-groups; many nodes
//! progress concurrently, driven by message completions multiplexed
//! through the async stage.

mod context;
mod neighborhood;
mod node;
mod wire;

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::Exchange;
use crate::error::ClusterError;
use crate::geometry::{BlockId, BoxId, IndexBox, IntVector, MAX_DIM};
use crate::patch::TagPatch;
use crate::stage::{AdvanceMode, CommStage};

use context::{RunContext, TagPool};
use node::{continue_algorithm, Arena, Phase};

/// How the owner of a split is chosen for the child nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerMode {
    /// The initial owner (rank 0) participates in and owns every node.
    SingleOwner,
    /// The rank with the greatest patch overlap on the child box.
    MostOverlap,
    /// The rank currently owning the fewest dendrogram nodes.
    FewestOwned,
    /// The rank currently participating in the fewest dendrogram nodes.
    LeastActive,
}

/// Which neighborhood relationships to compute after clustering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationshipMode {
    /// No relationship computation.
    None,
    /// Directed relationships from tag boxes to output boxes only.
    TagToNew,
    /// Both directions, with an owner-to-owner sharing pass.
    Bidirectional,
}

/// Directed neighbor sets keyed by box identity; each neighbor carries its
/// box for overlap queries.
pub type Neighborhood = BTreeMap<BoxId, BTreeSet<(BoxId, IndexBox)>>;

/// Parameters of a clustering run.
///
/// Construct with [`ClusterParameters::new`] and adjust with the
/// builder-style setters:
///
/// ```
/// use br_cluster::cluster::ClusterParameters;
/// use br_cluster::geometry::IntVector;
///
/// let params = ClusterParameters::new(2)
///     .with_efficiency_tol(0.9)
///     .with_max_box_size(IntVector::uniform(2, 16));
/// ```
#[derive(Clone, Debug)]
pub struct ClusterParameters {
    /// A cell is tagged iff its field value equals this.
    pub tag_val: i32,
    /// Advisory lower bound on output box size per dimension; shrinking
    /// and cutting keep boxes at least this large where possible.
    pub min_box: IntVector,
    /// Hard upper bound on output box size per dimension.
    pub max_box_size: IntVector,
    /// A box is accepted when its tag fraction reaches this value.
    pub efficiency_tol: f64,
    /// Two sibling boxes recombine when the combined box reaches
    /// `combine_tol * efficiency_tol`.
    pub combine_tol: f64,
    /// Fraction of the half extent around the box center within which the
    /// Laplacian cut may fall. Zero cuts only at the center plane.
    pub max_lap_cut_from_center: f64,
    /// Growth applied when testing boxes for neighborship, and when
    /// counting patch overlap for the group split.
    pub ghost_cell_width: IntVector,
    /// How child owners are elected.
    pub owner_mode: OwnerMode,
    /// How the driver advances the asynchronous algorithm.
    pub advance_mode: AdvanceMode,
    /// Which neighborhood relationships to compute.
    pub relationships: RelationshipMode,
    /// Override of the transport's message-tag upper bound, mainly for
    /// testing pool exhaustion.
    pub tag_upper_bound: Option<i32>,
}

impl ClusterParameters {
    /// Defaults for a run of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            tag_val: 1,
            min_box: IntVector::uniform(dim, 1),
            max_box_size: IntVector::uniform(dim, i32::MAX / 4),
            efficiency_tol: 0.8,
            combine_tol: 1.0,
            max_lap_cut_from_center: 1.0,
            ghost_cell_width: IntVector::uniform(dim, 1),
            owner_mode: OwnerMode::MostOverlap,
            advance_mode: AdvanceMode::AdvanceSome,
            relationships: RelationshipMode::Bidirectional,
            tag_upper_bound: None,
        }
    }

    /// Set the tag value.
    pub fn with_tag_val(mut self, tag_val: i32) -> Self {
        self.tag_val = tag_val;
        self
    }

    /// Set the advisory minimum box size.
    pub fn with_min_box(mut self, min_box: IntVector) -> Self {
        self.min_box = min_box;
        self
    }

    /// Set the maximum box size.
    pub fn with_max_box_size(mut self, max_box_size: IntVector) -> Self {
        self.max_box_size = max_box_size;
        self
    }

    /// Set the efficiency tolerance.
    pub fn with_efficiency_tol(mut self, efficiency_tol: f64) -> Self {
        self.efficiency_tol = efficiency_tol;
        self
    }

    /// Set the recombination tolerance.
    pub fn with_combine_tol(mut self, combine_tol: f64) -> Self {
        self.combine_tol = combine_tol;
        self
    }

    /// Set the Laplacian cut window.
    pub fn with_max_lap_cut_from_center(mut self, fraction: f64) -> Self {
        self.max_lap_cut_from_center = fraction;
        self
    }

    /// Set the ghost width for neighborship tests.
    pub fn with_ghost_cell_width(mut self, ghost_cell_width: IntVector) -> Self {
        self.ghost_cell_width = ghost_cell_width;
        self
    }

    /// Set the owner election mode.
    pub fn with_owner_mode(mut self, owner_mode: OwnerMode) -> Self {
        self.owner_mode = owner_mode;
        self
    }

    /// Set the driver advance mode.
    pub fn with_advance_mode(mut self, advance_mode: AdvanceMode) -> Self {
        self.advance_mode = advance_mode;
        self
    }

    /// Set the relationship computation mode.
    pub fn with_relationships(mut self, relationships: RelationshipMode) -> Self {
        self.relationships = relationships;
        self
    }

    /// Override the message-tag upper bound.
    pub fn with_tag_upper_bound(mut self, tag_upper_bound: i32) -> Self {
        self.tag_upper_bound = Some(tag_upper_bound);
        self
    }

    fn validate(&self, dim: usize, size: usize, transport_bound: i32) -> Result<(), ClusterError> {
        if dim < 1 || dim > MAX_DIM {
            return Err(ClusterError::config(format!(
                "dimension {dim} outside 1..={MAX_DIM}"
            )));
        }
        for (name, v) in [
            ("min_box", &self.min_box),
            ("max_box_size", &self.max_box_size),
            ("ghost_cell_width", &self.ghost_cell_width),
        ] {
            if v.dim() != dim {
                return Err(ClusterError::config(format!(
                    "{name} has dimension {} but the run has dimension {dim}",
                    v.dim()
                )));
            }
        }
        if !self.min_box.all_ge(&IntVector::uniform(dim, 1)) {
            return Err(ClusterError::config("min_box must be at least 1 per dimension"));
        }
        if !self.max_box_size.all_ge(&IntVector::uniform(dim, 1)) {
            return Err(ClusterError::config(
                "max_box_size must be at least 1 per dimension",
            ));
        }
        if !self.ghost_cell_width.all_ge(&IntVector::zero(dim)) {
            return Err(ClusterError::config("ghost_cell_width must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.efficiency_tol) {
            return Err(ClusterError::config(format!(
                "efficiency_tol {} outside [0, 1]",
                self.efficiency_tol
            )));
        }
        if self.combine_tol <= 0.0 {
            return Err(ClusterError::config(format!(
                "combine_tol {} must be positive",
                self.combine_tol
            )));
        }
        if !(0.0..=1.0).contains(&self.max_lap_cut_from_center) {
            return Err(ClusterError::config(format!(
                "max_lap_cut_from_center {} outside [0, 1]",
                self.max_lap_cut_from_center
            )));
        }
        let bound = self.tag_upper_bound.unwrap_or(transport_bound);
        if bound < 1 || bound / (size as i32) < 1 {
            return Err(ClusterError::config(format!(
                "tag upper bound {bound} leaves no tags for {size} ranks"
            )));
        }
        Ok(())
    }
}

/// Counters describing one run, gathered per rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunStatistics {
    /// Global number of tags clustered.
    pub num_tags: i64,
    /// Output boxes this rank saw being generated (not necessarily owned).
    pub boxes_generated: usize,
    /// Peak number of dendrogram nodes held at once.
    pub max_nodes: usize,
    /// Deepest generation reached (root is 1).
    pub max_generation: u32,
    /// Peak number of nodes owned at once.
    pub max_owned: usize,
    /// Mean `continue_algorithm` calls per completed node.
    pub avg_continues: f64,
    /// Largest `continue_algorithm` call count of any node.
    pub max_continues: u32,
}

/// Outputs of one clustering run on one rank.
#[derive(Clone, Debug)]
pub struct ClusterRun {
    /// Index space the run covered.
    pub block_id: BlockId,
    /// Output boxes owned by this rank.
    pub new_boxes: BTreeMap<BoxId, IndexBox>,
    /// Every output box this rank participated in or observed, including
    /// remotely owned ones.
    pub visible_boxes: BTreeMap<BoxId, IndexBox>,
    /// Relationships from local tag boxes to output boxes.
    pub tag_to_new: Neighborhood,
    /// Relationships from owned output boxes back to tag boxes.
    pub new_to_tag: Neighborhood,
    /// Per-rank run statistics.
    pub statistics: RunStatistics,
}

/// Cluster the tagged cells of `patches` inside `bound_box` and compute
/// the configured neighborhood relationships.
///
/// The call is collective: every rank of the exchange must enter it with
/// the same bounding box and parameters. On return the output boxes are
/// owner-partitioned across the ranks; asynchronous advance modes make no
/// guarantee on the order in which boxes were created, so callers needing
/// determinism sort the outputs.
pub fn cluster_and_compute_relationships<E: Exchange, P: TagPatch>(
    exchange: &E,
    patches: &[P],
    bound_box: IndexBox,
    block_id: BlockId,
    params: &ClusterParameters,
) -> Result<ClusterRun, ClusterError> {
    let dim = bound_box.dim();
    let rank = exchange.rank();
    let size = exchange.size();

    params.validate(dim, size, exchange.tag_upper_bound())?;
    if bound_box.is_empty() {
        return Err(ClusterError::config("empty bounding box"));
    }
    for patch in patches {
        if patch.index_box().dim() != dim {
            return Err(ClusterError::config(format!(
                "patch dimension {} does not match the bounding box dimension {dim}",
                patch.index_box().dim()
            )));
        }
    }

    let tag_upper_bound = params
        .tag_upper_bound
        .unwrap_or(exchange.tag_upper_bound())
        .min(exchange.tag_upper_bound());

    let mut stage = CommStage::new();
    stage.set_synchronous(params.advance_mode == AdvanceMode::Synchronous);

    let mut ctx = RunContext {
        params,
        patches,
        dim,
        rank,
        size,
        relaunch: Default::default(),
        stage,
        tag_pool: TagPool::partition(rank, size, tag_upper_bound),
        tag_upper_bound,
        visible: BTreeMap::new(),
        nodes_owned: 0,
        nodes_active: 0,
        num_tags: 0,
        stats: Default::default(),
    };
    let mut arena = Arena::default();
    let root = node::launch_root(&mut arena, &mut ctx, bound_box)?;

    // The driver: pop ready nodes in FIFO order and advance each as far
    // as its messages allow, then wait on the stage for more completions.
    loop {
        while let Some(h) = ctx.relaunch.pop_front() {
            continue_algorithm(h, &mut arena, &mut ctx, exchange)?;
        }

        if ctx.stage.is_empty() {
            if arena.nodes[root].phase == Phase::Completed {
                break;
            }
            return Err(ClusterError::invariant(
                "engine stalled with no outstanding work",
            ));
        }

        let ready = match params.advance_mode {
            AdvanceMode::AdvanceAny => ctx.stage.advance_any(|h| {
                arena.nodes[h]
                    .comm
                    .as_mut()
                    .expect("staged node without collective")
                    .check(exchange)
            })?,
            _ => ctx.stage.advance_some(|h| {
                arena.nodes[h]
                    .comm
                    .as_mut()
                    .expect("staged node without collective")
                    .check(exchange)
            })?,
        };
        for h in ready {
            ctx.relaunch.push_back(h);
        }
    }

    let (tag_to_new, new_to_tag) = neighborhood::compute_relationships(&ctx, exchange)?;

    let new_boxes = ctx
        .visible
        .iter()
        .filter(|(id, _)| id.owner == rank)
        .map(|(id, visible)| (*id, visible.box_))
        .collect();
    let visible_boxes = ctx
        .visible
        .iter()
        .map(|(id, visible)| (*id, visible.box_))
        .collect();

    Ok(ClusterRun {
        block_id,
        new_boxes,
        visible_boxes,
        tag_to_new,
        new_to_tag,
        statistics: ctx.statistics(),
    })
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rstest::rstest;

    use super::*;
    use crate::comm::ThreadWorld;
    use crate::patch::Patch;

    fn box1(lo: i32, hi: i32) -> IndexBox {
        IndexBox::new(IntVector::new(&[lo]), IntVector::new(&[hi]))
    }

    fn box2(lo: [i32; 2], hi: [i32; 2]) -> IndexBox {
        IndexBox::new(IntVector::new(&lo), IntVector::new(&hi))
    }

    // Run one rank per thread over a shared mailbox world and collect the
    // per-rank results in rank order.
    fn run_world<F>(
        size: usize,
        bound: IndexBox,
        params: &ClusterParameters,
        patches_for: F,
    ) -> Vec<ClusterRun>
    where
        F: Fn(usize) -> Vec<Patch> + Sync,
    {
        let endpoints = ThreadWorld::connect(size);
        std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|exchange| {
                    let patches_for = &patches_for;
                    scope.spawn(move || {
                        let patches = patches_for(exchange.rank());
                        cluster_and_compute_relationships(
                            &exchange,
                            &patches,
                            bound,
                            BlockId(0),
                            params,
                        )
                        .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn global_boxes(runs: &[ClusterRun]) -> Vec<IndexBox> {
        let mut boxes: Vec<IndexBox> = runs
            .iter()
            .flat_map(|run| run.new_boxes.values().copied())
            .collect();
        boxes.sort_unstable();
        boxes
    }

    // Every tagged cell must lie in exactly one output box and the boxes
    // must be pairwise disjoint.
    fn assert_coverage(
        bound: &IndexBox,
        is_tagged: impl Fn(&IntVector) -> bool,
        boxes: &[IndexBox],
    ) {
        for cell in bound.cells() {
            let covering = boxes.iter().filter(|b| b.contains(&cell)).count();
            if is_tagged(&cell) {
                assert_eq!(covering, 1, "tagged cell {cell} covered {covering} times");
            }
        }
        for (i, a) in boxes.iter().enumerate() {
            for b in &boxes[i + 1..] {
                assert!(!a.intersects(b), "output boxes {a} and {b} overlap");
            }
        }
    }

    fn assert_efficiency(
        boxes: &[IndexBox],
        is_tagged: impl Fn(&IntVector) -> bool,
        floor: f64,
    ) {
        for b in boxes {
            let tags = b.cells().filter(|cell| is_tagged(cell)).count();
            let efficiency = tags as f64 / b.volume() as f64;
            assert!(
                efficiency + 1e-12 >= floor,
                "box {b} has efficiency {efficiency}, expected at least {floor}"
            );
        }
    }

    // Split the bound into near-even slabs along dimension `d`.
    fn slab(bound: &IndexBox, d: usize, part: usize, parts: usize) -> Option<IndexBox> {
        let extent = bound.size(d);
        let per = extent / parts as i32;
        let rem = extent % parts as i32;
        let start = bound.lower()[d]
            + per * part as i32
            + (part as i32).min(rem);
        let len = per + i32::from((part as i32) < rem);
        if len == 0 {
            return None;
        }
        let mut lo = bound.lower();
        let mut hi = bound.upper();
        lo[d] = start;
        hi[d] = start + len - 1;
        Some(IndexBox::new(lo, hi))
    }

    fn random_tags(seed: u64, bound: &IndexBox, density: f64) -> BTreeSet<IntVector> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        bound.cells().filter(|_| rng.gen_bool(density)).collect()
    }

    #[test]
    fn test_s1_empty_tags() {
        let bound = box2([0, 0], [9, 9]);
        let params = ClusterParameters::new(2);

        for size in [1, 2] {
            let runs = run_world(size, bound, &params, |rank| {
                slab(&bound, 0, rank, size)
                    .map(|b| Patch::filled(b, 0))
                    .into_iter()
                    .collect()
            });
            assert!(global_boxes(&runs).is_empty());
            for run in &runs {
                assert!(run.tag_to_new.is_empty());
                assert!(run.new_to_tag.is_empty());
                assert_eq!(run.statistics.num_tags, 0);
            }
        }
    }

    #[test]
    fn test_s2_single_filled_box() {
        let bound = box2([0, 0], [9, 9]);
        let params = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_max_box_size(IntVector::uniform(2, 16));

        for size in [1, 4, 8] {
            let runs = run_world(size, bound, &params, |rank| {
                slab(&bound, 1, rank, size)
                    .map(|b| Patch::filled(b, 1))
                    .into_iter()
                    .collect()
            });
            assert_eq!(global_boxes(&runs), vec![bound]);
            for run in &runs {
                assert_eq!(run.statistics.num_tags, 100);
                assert_eq!(run.visible_boxes.values().copied().collect::<Vec<_>>(), vec![bound]);
                // Each local tag box neighbors the single output box.
                assert_eq!(run.tag_to_new.len(), 1);
            }
        }
    }

    #[test]
    fn test_s3_two_clusters_zero_swath() {
        let bound = box1(0, 10);
        let is_tagged = |cell: &IntVector| cell[0] <= 3 || cell[0] >= 7;
        let params = ClusterParameters::new(1).with_efficiency_tol(0.8);

        let runs = run_world(1, bound, &params, |_| {
            vec![Patch::from_fn(bound, |cell| is_tagged(cell) as i32)]
        });
        assert_eq!(global_boxes(&runs), vec![box1(0, 3), box1(7, 10)]);
        assert_eq!(runs[0].statistics.max_generation, 2);
    }

    #[test]
    fn test_s4_laplacian_split() {
        // Dense columns 0..=2 and 6..=8 with three stray tags in between;
        // no zero swath exists along x, so the split is Laplacian driven.
        let bound = box2([0, 0], [8, 4]);
        let is_tagged = |cell: &IntVector| {
            cell[0] <= 2
                || cell[0] >= 6
                || matches!((cell[0], cell[1]), (3, 1) | (4, 2) | (5, 3))
        };
        let params = ClusterParameters::new(2).with_efficiency_tol(0.8);

        let runs = run_world(1, bound, &params, |_| {
            vec![Patch::from_fn(bound, |cell| is_tagged(cell) as i32)]
        });
        let boxes = global_boxes(&runs);

        assert!(boxes.contains(&box2([0, 0], [2, 4])));
        assert!(boxes.contains(&box2([6, 0], [8, 4])));
        assert_coverage(&bound, is_tagged, &boxes);
        assert_efficiency(&boxes, is_tagged, 0.8);
    }

    #[test]
    fn test_s5_recombination() {
        // Only cell 4 is untagged. The root misses the tolerance and
        // splits through the single-cell zero swath; both children are
        // accepted and recombine back into the root box.
        let bound = box1(0, 9);
        let is_tagged = |cell: &IntVector| cell[0] != 4;
        let params = ClusterParameters::new(1)
            .with_efficiency_tol(0.95)
            .with_combine_tol(0.9)
            .with_max_box_size(IntVector::new(&[16]));

        let runs = run_world(1, bound, &params, |_| {
            vec![Patch::from_fn(bound, |cell| is_tagged(cell) as i32)]
        });
        assert_eq!(global_boxes(&runs), vec![box1(0, 9)]);
    }

    #[test]
    fn test_recombination_respects_max_box_size() {
        let bound = box1(0, 9);
        let is_tagged = |cell: &IntVector| cell[0] != 4;
        let params = ClusterParameters::new(1)
            .with_efficiency_tol(0.95)
            .with_combine_tol(0.9)
            .with_max_box_size(IntVector::new(&[8]));

        let runs = run_world(1, bound, &params, |_| {
            vec![Patch::from_fn(bound, |cell| is_tagged(cell) as i32)]
        });
        assert_eq!(global_boxes(&runs), vec![box1(0, 3), box1(5, 9)]);
    }

    #[rstest]
    #[case::synchronous(AdvanceMode::Synchronous)]
    #[case::advance_any(AdvanceMode::AdvanceAny)]
    #[case::advance_some(AdvanceMode::AdvanceSome)]
    fn test_s6_split_with_dropouts(#[case] advance_mode: AdvanceMode) {
        // Four ranks hold horizontal strips; only the top and bottom
        // strips carry tags. After the split the upper half belongs to
        // ranks {0, 1} and the lower half to {2, 3}; the other two ranks
        // drop out of each half and still learn the final boxes through
        // the dropout broadcast.
        let bound = box2([0, 0], [7, 7]);
        let params = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_ghost_cell_width(IntVector::zero(2))
            .with_advance_mode(advance_mode);

        let runs = run_world(4, bound, &params, |rank| {
            let strip = box2([0, 2 * rank as i32], [7, 2 * rank as i32 + 1]);
            let tagged = rank == 0 || rank == 3;
            vec![Patch::filled(strip, tagged as i32)]
        });

        let top = box2([0, 0], [7, 1]);
        let bottom = box2([0, 6], [7, 7]);
        assert_eq!(global_boxes(&runs), vec![top, bottom]);

        // Every rank, including the dropouts of each half, observed both
        // final boxes.
        for run in &runs {
            let visible: Vec<_> = run.visible_boxes.values().copied().collect();
            assert_eq!(visible, vec![top, bottom]);
        }

        // Most-overlap ownership with ties broken by lower rank.
        assert_eq!(runs[0].new_boxes.len(), 1);
        assert_eq!(runs[2].new_boxes.len(), 1);
        assert!(runs[1].new_boxes.is_empty());
        assert!(runs[3].new_boxes.is_empty());
    }

    #[test]
    fn test_output_invariant_to_distribution() {
        let bound = box2([0, 0], [31, 31]);
        let params = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_max_box_size(IntVector::uniform(2, 8));

        for seed in [1, 7, 23] {
            let tags = random_tags(seed, &bound, 0.25);
            let is_tagged = |cell: &IntVector| tags.contains(cell);

            let mut all_outputs = Vec::new();
            for size in [1, 2, 4] {
                // Slabs along x, and along y for the largest size, give
                // several distinct decompositions of the same tag field.
                for d in if size == 4 { vec![0, 1] } else { vec![0] } {
                    let runs = run_world(size, bound, &params, |rank| {
                        slab(&bound, d, rank, size)
                            .map(|b| Patch::from_fn(b, |cell| is_tagged(cell) as i32))
                            .into_iter()
                            .collect()
                    });
                    all_outputs.push(global_boxes(&runs));
                }
            }

            let reference = &all_outputs[0];
            assert_coverage(&bound, is_tagged, reference);
            assert_efficiency(reference, is_tagged, 0.8);
            for b in reference {
                assert!(b.size(0) <= 8 && b.size(1) <= 8);
            }
            for other in &all_outputs[1..] {
                assert_eq!(other, reference);
            }
        }
    }

    #[test]
    fn test_neighborhood_symmetry() {
        let bound = box2([0, 0], [31, 31]);
        let params = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_max_box_size(IntVector::uniform(2, 8));
        let tags = random_tags(11, &bound, 0.2);
        let is_tagged = |cell: &IntVector| tags.contains(cell);

        let runs = run_world(4, bound, &params, |rank| {
            slab(&bound, 0, rank, 4)
                .map(|b| Patch::from_fn(b, |cell| is_tagged(cell) as i32))
                .into_iter()
                .collect()
        });

        let mut forward = BTreeSet::new();
        let mut reverse = BTreeSet::new();
        for run in &runs {
            for (tag_id, neighbors) in &run.tag_to_new {
                for (new_id, _) in neighbors {
                    forward.insert((*tag_id, *new_id));
                }
            }
            for (new_id, neighbors) in &run.new_to_tag {
                for (tag_id, _) in neighbors {
                    reverse.insert((*tag_id, *new_id));
                }
            }
        }
        assert!(!forward.is_empty());
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_synchronous_runs_are_identical() {
        let bound = box2([0, 0], [31, 31]);
        let params = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_max_box_size(IntVector::uniform(2, 8))
            .with_advance_mode(AdvanceMode::Synchronous);
        let tags = random_tags(3, &bound, 0.3);
        let is_tagged = |cell: &IntVector| tags.contains(cell);

        let patches_for = |rank: usize| {
            slab(&bound, 0, rank, 2)
                .map(|b| Patch::from_fn(b, |cell| is_tagged(cell) as i32))
                .into_iter()
                .collect::<Vec<_>>()
        };
        let first = run_world(2, bound, &params, patches_for);
        let second = run_world(2, bound, &params, patches_for);

        assert_eq!(global_boxes(&first), global_boxes(&second));
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.new_boxes, b.new_boxes);
            assert_eq!(a.tag_to_new, b.tag_to_new);
            assert_eq!(a.new_to_tag, b.new_to_tag);
        }
    }

    #[rstest]
    #[case::single_owner(OwnerMode::SingleOwner)]
    #[case::fewest_owned(OwnerMode::FewestOwned)]
    #[case::least_active(OwnerMode::LeastActive)]
    fn test_owner_modes_produce_the_same_boxes(#[case] owner_mode: OwnerMode) {
        let bound = box2([0, 0], [31, 31]);
        let tags = random_tags(5, &bound, 0.25);
        let is_tagged = |cell: &IntVector| tags.contains(cell);
        let patches_for = |rank: usize| {
            slab(&bound, 0, rank, 4)
                .map(|b| Patch::from_fn(b, |cell| is_tagged(cell) as i32))
                .into_iter()
                .collect::<Vec<_>>()
        };

        let base = ClusterParameters::new(2)
            .with_efficiency_tol(0.8)
            .with_max_box_size(IntVector::uniform(2, 8));
        let reference = global_boxes(&run_world(4, bound, &base, patches_for));

        let params = base.clone().with_owner_mode(owner_mode);
        let runs = run_world(4, bound, &params, patches_for);
        assert_eq!(global_boxes(&runs), reference);
        assert_coverage(&bound, is_tagged, &reference);

        if owner_mode == OwnerMode::SingleOwner {
            // Rank 0 owns every node and therefore every box.
            for run in &runs[1..] {
                assert!(run.new_boxes.is_empty());
            }
        }
    }

    #[test]
    fn test_statistics() {
        let bound = box1(0, 10);
        let is_tagged = |cell: &IntVector| cell[0] <= 3 || cell[0] >= 7;
        let params = ClusterParameters::new(1).with_efficiency_tol(0.8);

        let runs = run_world(1, bound, &params, |_| {
            vec![Patch::from_fn(bound, |cell| is_tagged(cell) as i32)]
        });
        let stats = &runs[0].statistics;
        assert_eq!(stats.num_tags, 8);
        assert_eq!(stats.boxes_generated, 2);
        assert_eq!(stats.max_generation, 2);
        assert_eq!(stats.max_owned, 3);
        assert!(stats.max_continues >= 1);
        assert!(stats.avg_continues >= 1.0);
    }

    #[rstest]
    #[case::efficiency_above_one(ClusterParameters::new(2).with_efficiency_tol(1.5))]
    #[case::zero_combine(ClusterParameters::new(2).with_combine_tol(0.0))]
    #[case::negative_window(ClusterParameters::new(2).with_max_lap_cut_from_center(-0.1))]
    #[case::wrong_dimension(ClusterParameters::new(1))]
    #[case::zero_min_box(ClusterParameters::new(2).with_min_box(IntVector::zero(2)))]
    #[case::no_tags_available(ClusterParameters::new(2).with_tag_upper_bound(0))]
    fn test_invalid_configuration(#[case] params: ClusterParameters) {
        let bound = box2([0, 0], [9, 9]);
        let exchange = ThreadWorld::connect(1).pop().unwrap();
        let patches: Vec<Patch> = Vec::new();
        let err = cluster_and_compute_relationships(&exchange, &patches, bound, BlockId(0), &params)
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration { .. }));
    }

    #[test]
    fn test_empty_bounding_box_is_rejected() {
        let bound = IndexBox::new(IntVector::new(&[0]), IntVector::new(&[-1]));
        let exchange = ThreadWorld::connect(1).pop().unwrap();
        let patches: Vec<Patch> = Vec::new();
        let err = cluster_and_compute_relationships(
            &exchange,
            &patches,
            bound,
            BlockId(0),
            &ClusterParameters::new(1),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration { .. }));
    }

    #[test]
    fn test_tag_pool_exhaustion() {
        // Alternating tags force repeated splits; four tags cover the
        // root plus one split, so the second split runs dry.
        let bound = box1(0, 6);
        let params = ClusterParameters::new(1)
            .with_efficiency_tol(1.0)
            .with_tag_upper_bound(4);

        let exchange = ThreadWorld::connect(1).pop().unwrap();
        let patches = vec![Patch::from_fn(bound, |cell| (cell[0] % 2 == 0) as i32)];
        let err = cluster_and_compute_relationships(&exchange, &patches, bound, BlockId(0), &params)
            .unwrap_err();
        assert!(matches!(err, ClusterError::TagPoolExhausted { .. }));
    }

    #[test]
    fn test_tag_to_new_mode_skips_reverse_sets() {
        let bound = box2([0, 0], [9, 9]);
        let params = ClusterParameters::new(2)
            .with_max_box_size(IntVector::uniform(2, 16))
            .with_relationships(RelationshipMode::TagToNew);

        let runs = run_world(2, bound, &params, |rank| {
            slab(&bound, 1, rank, 2)
                .map(|b| Patch::filled(b, 1))
                .into_iter()
                .collect()
        });
        for run in &runs {
            assert!(!run.tag_to_new.is_empty());
            assert!(run.new_to_tag.is_empty());
        }
    }
}
