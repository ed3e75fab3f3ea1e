//! Test bidirectional neighborhood computation across MPI ranks.

use br_cluster::cluster::{
    cluster_and_compute_relationships, ClusterParameters, RelationshipMode,
};
use br_cluster::comm::mpi::MpiExchange;
use br_cluster::geometry::{BlockId, IndexBox, IntVector};
use br_cluster::patch::Patch;
use mpi::traits::Communicator;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let size = world.size() as usize;

    // Two tagged blocks at opposite corners of the domain; every rank
    // holds one horizontal slab.
    let n = 32;
    let bound = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[n - 1, n - 1]));

    let rows = n / size as i32;
    let lo = rank as i32 * rows;
    let hi = if rank == size - 1 { n - 1 } else { lo + rows - 1 };
    let slab = IndexBox::new(IntVector::new(&[0, lo]), IntVector::new(&[n - 1, hi]));

    let patch = Patch::from_fn(slab, |cell| {
        let in_low = cell[0] < 8 && cell[1] < 8;
        let in_high = cell[0] >= n - 8 && cell[1] >= n - 8;
        (in_low || in_high) as i32
    });

    let params = ClusterParameters::new(2)
        .with_efficiency_tol(0.8)
        .with_max_box_size(IntVector::uniform(2, 8))
        .with_relationships(RelationshipMode::Bidirectional);

    let exchange = MpiExchange::new(world);
    let run =
        cluster_and_compute_relationships(&exchange, &[patch], bound, BlockId(0), &params)
            .unwrap();

    // Check symmetry for the locally owned output boxes: every reverse
    // relationship lists a tag box that is a neighbor of the output box.
    let gcw = IntVector::uniform(2, 1);
    for (new_id, neighbors) in &run.new_to_tag {
        let new_box = run.new_boxes[new_id];
        for (_, tag_box) in neighbors {
            assert!(tag_box.grow(&gcw).intersects(&new_box));
        }
    }

    println!(
        "rank {}: {} owned boxes, {} tag->new entries, {} new->tag entries",
        rank,
        run.new_boxes.len(),
        run.tag_to_new.len(),
        run.new_to_tag.len(),
    );
}
