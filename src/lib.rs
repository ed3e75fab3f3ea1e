//! A Rust based distributed Berger-Rigoutsos clustering library
//!
//! This library clusters *tagged* cells of a structured adaptive mesh into
//! axis-aligned integer boxes, following the algorithm of Berger and
//! Rigoutsos (IEEE Trans. on Sys., Man, and Cyber (21)5:1278-1286) in the
//! non-recursive, asynchronous formulation used by large SAMR codes.
//!
//! The tagged cells live on patches distributed across the ranks of a
//! message exchange. The engine walks a binary dendrogram of candidate
//! boxes: each node of the dendrogram reduces a tag histogram to an owner
//! rank, which accepts the box or cuts it and spawns two child nodes on
//! sub-groups of the participating ranks. Many nodes progress at once,
//! driven by message completions, so the algorithm overlaps communication
//! across the whole tree instead of synchronizing level by level.
//!
//! ## Using the library
//!
//! A run needs an exchange (in-process threads, or MPI with the `mpi`
//! feature), the local patches of the tag field, a global bounding box and
//! the clustering parameters:
//!
//! ```
//! use br_cluster::cluster::{cluster_and_compute_relationships, ClusterParameters};
//! use br_cluster::comm::ThreadWorld;
//! use br_cluster::geometry::{BlockId, IndexBox, IntVector};
//! use br_cluster::patch::Patch;
//!
//! let bound = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[9, 9]));
//! let patches = vec![Patch::filled(bound, 1)];
//! let params = ClusterParameters::new(2)
//!     .with_max_box_size(IntVector::uniform(2, 16));
//!
//! let exchange = ThreadWorld::connect(1).pop().unwrap();
//! let run = cluster_and_compute_relationships(
//!     &exchange, &patches, bound, BlockId(0), &params)
//!     .unwrap();
//! assert_eq!(run.new_boxes.len(), 1);
//! ```
//!
//! Output boxes are partitioned across the ranks by ownership. The
//! asynchronous advance modes make no guarantee on the order in which
//! boxes are produced; callers needing a deterministic order sort the
//! output.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod cluster;
pub mod comm;
pub mod error;
pub mod geometry;
pub mod group;
pub mod histogram;
pub mod patch;
pub mod stage;

pub use crate::cluster::{
    cluster_and_compute_relationships, ClusterParameters, ClusterRun, Neighborhood, OwnerMode,
    RelationshipMode, RunStatistics,
};
pub use crate::error::ClusterError;
pub use crate::stage::AdvanceMode;
