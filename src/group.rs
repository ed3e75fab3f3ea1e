//! Tree-shaped collectives over an arbitrary group of ranks.
//!
//! A [`CommGroup`] arranges an ordered rank list as a tree rooted at a
//! designated member and runs one collective at a time over it, using a
//! single scalar message tag. Operations are non-blocking and resumable:
//! starting an operation posts what it can and every [`CommGroup::check`]
//! call receives what has arrived and advances the internal state. Many
//! groups can be in flight at once without interfering as long as their
//! `(rank, tag)` channels differ.

use itertools::Itertools;

use crate::comm::{CommError, Exchange};

/// Result of polling a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    /// The running collective finished (or no collective is running).
    Complete,
    /// Messages were consumed but the collective is not finished.
    Progressed,
    /// Nothing new arrived.
    Pending,
}

enum Operation {
    ReduceSum {
        buf: Vec<i32>,
        waiting: Vec<usize>,
    },
    Broadcast {
        buf: Option<Vec<i32>>,
    },
    Gather {
        chunk_len: usize,
        collected: Vec<(usize, Vec<i32>)>,
        waiting: Vec<usize>,
    },
}

/// A communication group with one resumable collective at a time.
pub struct CommGroup {
    members: Vec<usize>,
    root_index: usize,
    my_index: usize,
    degree: usize,
    tag: i32,
    op: Option<Operation>,
    result: Option<Vec<i32>>,
    done: bool,
}

/// Pick a communication tree degree for a group size.
///
/// Small groups use a binary tree; larger groups grow the degree roughly
/// with the square root of the group size to shorten the tree.
pub fn communication_tree_degree(group_size: usize) -> usize {
    let mut degree = 2;
    while degree * degree < group_size {
        degree += 1;
    }
    degree
}

impl CommGroup {
    /// Create a group over `members` rooted at rank `root`.
    ///
    /// `members` must contain both `root` and the local rank `my_rank`.
    pub fn new(members: Vec<usize>, root: usize, my_rank: usize) -> Self {
        let root_index = members
            .iter()
            .position(|&r| r == root)
            .expect("root not in group");
        let my_index = members
            .iter()
            .position(|&r| r == my_rank)
            .expect("local rank not in group");
        let degree = communication_tree_degree(members.len());
        Self {
            members,
            root_index,
            my_index,
            degree,
            tag: 0,
            op: None,
            result: None,
            done: true,
        }
    }

    /// Set the message tag used by all collectives of this group.
    pub fn set_tag(&mut self, tag: i32) {
        self.tag = tag;
    }

    /// Return the group members in order.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// Return true if the local rank is the root.
    pub fn is_root(&self) -> bool {
        self.my_index == self.root_index
    }

    /// Return true if no collective is outstanding.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Take the result of the last completed collective.
    ///
    /// The reduced buffer on the root after a reduction, the payload after
    /// a broadcast, the concatenated per-member contributions in group
    /// order on the root after a gather. `None` elsewhere.
    pub fn take_result(&mut self) -> Option<Vec<i32>> {
        self.result.take()
    }

    // Positions in the communication tree are the member indices rotated
    // so that the root sits at position zero.
    fn position_of(&self, index: usize) -> usize {
        let n = self.members.len();
        (index + n - self.root_index) % n
    }

    fn rank_at_position(&self, pos: usize) -> usize {
        let n = self.members.len();
        self.members[(self.root_index + pos) % n]
    }

    fn parent_rank(&self) -> Option<usize> {
        let pos = self.position_of(self.my_index);
        if pos == 0 {
            None
        } else {
            Some(self.rank_at_position((pos - 1) / self.degree))
        }
    }

    fn child_ranks(&self) -> Vec<usize> {
        let n = self.members.len();
        let pos = self.position_of(self.my_index);
        (1..=self.degree)
            .map(|c| self.degree * pos + c)
            .filter(|&c| c < n)
            .map(|c| self.rank_at_position(c))
            .collect()
    }

    /// Start a sum reduction to the root. Every member passes its local
    /// contribution; buffers must agree in length across the group.
    pub fn begin_reduce_sum<E: Exchange>(
        &mut self,
        exchange: &E,
        buf: Vec<i32>,
    ) -> Result<Poll, CommError> {
        debug_assert!(self.done, "collective already outstanding");
        self.done = false;
        self.result = None;
        self.op = Some(Operation::ReduceSum {
            buf,
            waiting: self.child_ranks(),
        });
        self.check(exchange)
    }

    /// Start a broadcast from the root. The root passes `Some(payload)`,
    /// every other member passes `None`.
    pub fn begin_broadcast<E: Exchange>(
        &mut self,
        exchange: &E,
        payload: Option<Vec<i32>>,
    ) -> Result<Poll, CommError> {
        debug_assert!(self.done, "collective already outstanding");
        debug_assert_eq!(self.is_root(), payload.is_some());
        self.done = false;
        self.result = None;
        self.op = Some(Operation::Broadcast { buf: payload });
        self.check(exchange)
    }

    /// Start a gather to the root. Every member contributes a chunk of the
    /// same length, which must not be empty.
    pub fn begin_gather<E: Exchange>(
        &mut self,
        exchange: &E,
        contribution: Vec<i32>,
    ) -> Result<Poll, CommError> {
        debug_assert!(self.done, "collective already outstanding");
        debug_assert!(!contribution.is_empty());
        self.done = false;
        self.result = None;
        let pos = self.position_of(self.my_index);
        self.op = Some(Operation::Gather {
            chunk_len: contribution.len(),
            collected: vec![(pos, contribution)],
            waiting: self.child_ranks(),
        });
        self.check(exchange)
    }

    /// Receive whatever has arrived for the running collective and advance
    /// it. Returns [`Poll::Complete`] once the collective has no more work.
    pub fn check<E: Exchange>(&mut self, exchange: &E) -> Result<Poll, CommError> {
        if self.done {
            return Ok(Poll::Complete);
        }
        exchange.progress()?;

        let mut progressed = false;
        let mut op = self.op.take().expect("pending group without operation");

        match &mut op {
            Operation::ReduceSum { buf, waiting } => {
                let mut still_waiting = Vec::new();
                for &child in waiting.iter() {
                    match exchange.try_recv(child, self.tag)? {
                        Some(msg) => {
                            if msg.len() != buf.len() {
                                return Err(CommError {
                                    reason: format!(
                                        "reduction buffer length mismatch: {} vs {}",
                                        msg.len(),
                                        buf.len()
                                    ),
                                });
                            }
                            for (slot, value) in buf.iter_mut().zip(msg) {
                                *slot += value;
                            }
                            progressed = true;
                        }
                        None => still_waiting.push(child),
                    }
                }
                *waiting = still_waiting;

                if waiting.is_empty() {
                    if let Some(parent) = self.parent_rank() {
                        exchange.send(parent, self.tag, std::mem::take(buf))?;
                    } else {
                        self.result = Some(std::mem::take(buf));
                    }
                    self.done = true;
                }
            }

            Operation::Broadcast { buf } => {
                if buf.is_none() {
                    let parent = self.parent_rank().expect("non-root without parent");
                    if let Some(msg) = exchange.try_recv(parent, self.tag)? {
                        *buf = Some(msg);
                        progressed = true;
                    }
                }
                if let Some(payload) = buf {
                    for child in self.child_ranks() {
                        exchange.send(child, self.tag, payload.clone())?;
                    }
                    self.result = Some(std::mem::take(payload));
                    self.done = true;
                }
            }

            Operation::Gather {
                chunk_len,
                collected,
                waiting,
            } => {
                let mut still_waiting = Vec::new();
                for &child in waiting.iter() {
                    match exchange.try_recv(child, self.tag)? {
                        Some(msg) => {
                            // A child forwards its own chunk and those of
                            // its subtree, each prefixed with its position.
                            if msg.len() % (1 + *chunk_len) != 0 {
                                return Err(CommError {
                                    reason: format!(
                                        "gather message length {} not a multiple of {}",
                                        msg.len(),
                                        1 + *chunk_len
                                    ),
                                });
                            }
                            for piece in msg.chunks_exact(1 + *chunk_len) {
                                collected.push((piece[0] as usize, piece[1..].to_vec()));
                            }
                            progressed = true;
                        }
                        None => still_waiting.push(child),
                    }
                }
                *waiting = still_waiting;

                if waiting.is_empty() {
                    if let Some(parent) = self.parent_rank() {
                        let mut msg = Vec::with_capacity(collected.len() * (1 + *chunk_len));
                        for (pos, chunk) in collected.iter() {
                            msg.push(*pos as i32);
                            msg.extend_from_slice(chunk);
                        }
                        exchange.send(parent, self.tag, msg)?;
                    } else {
                        // Assemble contributions in group order. A position
                        // converts back to a member index by undoing the
                        // root rotation.
                        let n = self.members.len();
                        let mut slots: Vec<Option<Vec<i32>>> = vec![None; n];
                        for (pos, chunk) in collected.drain(..) {
                            let index = (self.root_index + pos) % n;
                            slots[index] = Some(chunk);
                        }
                        self.result = Some(
                            slots
                                .into_iter()
                                .map(|slot| slot.expect("missing gather contribution"))
                                .concat(),
                        );
                    }
                    self.done = true;
                }
            }
        }

        self.op = if self.done { None } else { Some(op) };

        Ok(if self.done {
            Poll::Complete
        } else if progressed {
            Poll::Progressed
        } else {
            Poll::Pending
        })
    }

    /// Drive the running collective to completion by polling.
    pub fn complete<E: Exchange>(&mut self, exchange: &E) -> Result<(), CommError> {
        while self.check(exchange)? != Poll::Complete {
            exchange.progress()?;
        }
        Ok(())
    }
}
