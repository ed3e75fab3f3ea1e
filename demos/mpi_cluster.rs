//! Cluster a random tag field distributed across MPI ranks.

use br_cluster::cluster::{cluster_and_compute_relationships, ClusterParameters};
use br_cluster::comm::mpi::MpiExchange;
use br_cluster::geometry::{BlockId, IndexBox, IntVector};
use br_cluster::patch::Patch;
use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;
    let size = world.size() as usize;

    // Initialise a seeded Rng.
    let mut rng = ChaCha8Rng::seed_from_u64(rank as u64);

    // The global domain; each rank holds one horizontal slab of it.
    let n = 64;
    let bound = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[n - 1, n - 1]));

    let rows = n / size as i32;
    let lo = rank as i32 * rows;
    let hi = if rank == size - 1 { n - 1 } else { lo + rows - 1 };
    let slab = IndexBox::new(IntVector::new(&[0, lo]), IntVector::new(&[n - 1, hi]));

    // Tag roughly a fifth of the cells.
    let patch = Patch::from_fn(slab, |_| rng.gen_bool(0.2) as i32);

    let params = ClusterParameters::new(2)
        .with_efficiency_tol(0.8)
        .with_max_box_size(IntVector::uniform(2, 16));

    let exchange = MpiExchange::new(world);
    let run =
        cluster_and_compute_relationships(&exchange, &[patch], bound, BlockId(0), &params)
            .unwrap();

    println!(
        "rank {}: owns {} of {} visible boxes, {} tags clustered, max generation {}",
        rank,
        run.new_boxes.len(),
        run.visible_boxes.len(),
        run.statistics.num_tags,
        run.statistics.max_generation,
    );
}
