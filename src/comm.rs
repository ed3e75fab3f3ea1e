//! Message exchange between ranks.
//!
//! The clustering engine talks to the outside world through the narrow
//! [`Exchange`] trait: non-blocking tagged sends and matched receives of
//! `i32` buffers. Two transports are provided, an in-process mailbox world
//! for single-process runs and thread-based testing, and an MPI transport
//! behind the `mpi` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[cfg(feature = "mpi")]
pub mod mpi;

/// A transport failure.
///
/// The engine treats any transport failure as fatal and propagates it to
/// the caller; there is no retry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("communication failed: {reason}")]
pub struct CommError {
    /// Description of the failure.
    pub reason: String,
}

/// Non-blocking message exchange between the ranks of a run.
///
/// Sends are buffered and may not be delivered until the receiver polls.
/// Messages between a fixed `(source, dest, tag)` triple are delivered in
/// the order they were sent; messages on different triples are unordered.
pub trait Exchange {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Post a message to `dest`. The call never blocks on the receiver.
    fn send(&self, dest: usize, tag: i32, payload: Vec<i32>) -> Result<(), CommError>;

    /// Receive one whole message from `source` with `tag` if one has
    /// arrived.
    fn try_recv(&self, source: usize, tag: i32) -> Result<Option<Vec<i32>>, CommError>;

    /// Drive any outstanding internal work, such as completing buffered
    /// sends. Called from polling loops.
    fn progress(&self) -> Result<(), CommError>;

    /// Largest message tag the transport accepts.
    fn tag_upper_bound(&self) -> i32;
}

// One mailbox per rank. Queues are keyed by (source, tag) so that matched
// receives cannot observe messages out of channel order.
struct Mailbox {
    slots: Mutex<HashMap<(usize, i32), VecDeque<Vec<i32>>>>,
}

/// A set of in-process ranks connected through shared mailboxes.
///
/// The world owns no global state; dropping every endpoint drops the
/// mailboxes. Endpoints are handed to one thread each:
///
/// ```
/// use br_cluster::comm::{Exchange, ThreadWorld};
///
/// let mut endpoints = ThreadWorld::connect(2);
/// let receiver = endpoints.pop().unwrap();
/// let sender = endpoints.pop().unwrap();
/// sender.send(1, 5, vec![1, 2, 3]).unwrap();
/// assert_eq!(receiver.try_recv(0, 5).unwrap(), Some(vec![1, 2, 3]));
/// ```
pub struct ThreadWorld;

impl ThreadWorld {
    /// Create the endpoints of a world with `size` ranks, in rank order.
    pub fn connect(size: usize) -> Vec<ThreadExchange> {
        assert!(size >= 1);
        let mailboxes: Arc<Vec<Mailbox>> = Arc::new(
            (0..size)
                .map(|_| Mailbox {
                    slots: Mutex::new(HashMap::new()),
                })
                .collect(),
        );
        (0..size)
            .map(|rank| ThreadExchange {
                rank,
                size,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

/// One rank's endpoint of a [`ThreadWorld`].
pub struct ThreadExchange {
    rank: usize,
    size: usize,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl Exchange for ThreadExchange {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: usize, tag: i32, payload: Vec<i32>) -> Result<(), CommError> {
        debug_assert!(dest < self.size);
        let mut slots = self.mailboxes[dest]
            .slots
            .lock()
            .expect("mailbox poisoned");
        slots
            .entry((self.rank, tag))
            .or_default()
            .push_back(payload);
        Ok(())
    }

    fn try_recv(&self, source: usize, tag: i32) -> Result<Option<Vec<i32>>, CommError> {
        let mut slots = self.mailboxes[self.rank]
            .slots
            .lock()
            .expect("mailbox poisoned");
        Ok(slots
            .get_mut(&(source, tag))
            .and_then(|queue| queue.pop_front()))
    }

    fn progress(&self) -> Result<(), CommError> {
        // Delivery happens at send time; polling loops just need to let
        // the other endpoint threads run.
        std::thread::yield_now();
        Ok(())
    }

    fn tag_upper_bound(&self) -> i32 {
        i32::MAX
    }
}
