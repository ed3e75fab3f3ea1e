//! Typed wire messages of the dendrogram protocol.
//!
//! Every collective of a dendrogram node carries exactly one of the
//! message types below; all of them serialize to flat arrays of signed
//! 32-bit integers. Keeping the layouts in one place means the state
//! machine never touches raw buffer offsets.
//!
//! Layouts (boxes are `[lo_0..lo_{D-1}, hi_0..hi_{D-1}]`):
//!
//! - acceptability: `[acceptance, num_tags, box]` plus `[left, right]`
//!   child boxes when the box was rejected;
//! - grouping criteria (one chunk per member, gathered in group order):
//!   `[left_overlap, right_overlap]` plus the load count under the
//!   fewest-owned / least-active owner modes;
//! - child groups: per side `[box, owner, tag, group_len, ranks...]`;
//! - dropout notice: `[acceptance, subtree_boxes]` plus
//!   `[owner, seq, box]` when the subtree kept exactly one box;
//! - relationship batch: `[count]` then per entry
//!   `[new_seq, tag_owner, tag_index, tag_box]`.

use crate::error::ClusterError;
use crate::geometry::{BoxId, IndexBox};

use super::node::BoxAcceptance;

fn clamp_count(count: i64) -> i32 {
    count.min(i32::MAX as i64) as i32
}

/// The owner's verdict on a candidate box, broadcast to the group.
pub(crate) struct Acceptability {
    pub acceptance: BoxAcceptance,
    pub num_tags: i64,
    /// The candidate box after shrinking to the tags.
    pub box_: IndexBox,
    /// Present when the box was rejected and split.
    pub child_boxes: Option<(IndexBox, IndexBox)>,
}

impl Acceptability {
    pub fn encode(&self) -> Vec<i32> {
        let mut msg = vec![self.acceptance.code(), clamp_count(self.num_tags)];
        self.box_.pack_into(&mut msg);
        if let Some((left, right)) = self.child_boxes {
            left.pack_into(&mut msg);
            right.pack_into(&mut msg);
        }
        msg
    }

    pub fn decode(dim: usize, msg: &[i32]) -> Result<Self, ClusterError> {
        let acceptance = BoxAcceptance::from_code(msg[0])?;
        let num_tags = msg[1] as i64;
        let (box_, rest) = IndexBox::unpack(dim, &msg[2..]);
        let child_boxes = if rest.is_empty() {
            None
        } else {
            let (left, rest) = IndexBox::unpack(dim, rest);
            let (right, _) = IndexBox::unpack(dim, rest);
            Some((left, right))
        };
        Ok(Self {
            acceptance,
            num_tags,
            box_,
            child_boxes,
        })
    }
}

/// One member's contribution to the grouping-criteria gather.
pub(crate) struct GroupingCriteria {
    pub left_overlap: i32,
    pub right_overlap: i32,
    /// Owned or active node count under the load-balancing owner modes.
    pub load: Option<i32>,
}

impl GroupingCriteria {
    pub fn chunk_len(with_load: bool) -> usize {
        if with_load {
            3
        } else {
            2
        }
    }

    pub fn encode(&self) -> Vec<i32> {
        let mut chunk = vec![self.left_overlap, self.right_overlap];
        chunk.extend(self.load);
        chunk
    }

    pub fn decode(chunk: &[i32]) -> Self {
        Self {
            left_overlap: chunk[0],
            right_overlap: chunk[1],
            load: chunk.get(2).copied(),
        }
    }
}

/// One child of a split: its box, owner, message tag and group.
pub(crate) struct ChildAssignment {
    pub box_: IndexBox,
    pub owner: usize,
    pub tag: i32,
    pub group: Vec<usize>,
}

/// The split decision broadcast to the whole parent group.
pub(crate) struct ChildGroups {
    pub left: ChildAssignment,
    pub right: ChildAssignment,
}

impl ChildGroups {
    pub fn encode(&self) -> Vec<i32> {
        let mut msg = Vec::new();
        for side in [&self.left, &self.right] {
            side.box_.pack_into(&mut msg);
            msg.push(side.owner as i32);
            msg.push(side.tag);
            msg.push(side.group.len() as i32);
            msg.extend(side.group.iter().map(|&r| r as i32));
        }
        msg
    }

    pub fn decode(dim: usize, msg: &[i32]) -> Result<Self, ClusterError> {
        let mut rest = msg;
        let mut sides = Vec::with_capacity(2);
        for _ in 0..2 {
            let (box_, tail) = IndexBox::unpack(dim, rest);
            let group_len = tail[2] as usize;
            if tail.len() < 3 + group_len {
                return Err(ClusterError::invariant(
                    "truncated child-groups message",
                ));
            }
            sides.push(ChildAssignment {
                box_,
                owner: tail[0] as usize,
                tag: tail[1],
                group: tail[3..3 + group_len].iter().map(|&r| r as usize).collect(),
            });
            rest = &tail[3 + group_len..];
        }
        let right = sides.pop().expect("two sides decoded");
        let left = sides.pop().expect("two sides decoded");
        Ok(Self { left, right })
    }
}

/// Final disposition of a node, broadcast to the split's dropouts.
pub(crate) struct DropoutNotice {
    pub acceptance: BoxAcceptance,
    /// Output boxes in the subtree, saturated at 2.
    pub subtree_boxes: u8,
    /// The surviving box when the subtree kept exactly one.
    pub survivor: Option<(BoxId, IndexBox)>,
}

impl DropoutNotice {
    pub fn encode(&self) -> Vec<i32> {
        let mut msg = vec![self.acceptance.code(), self.subtree_boxes as i32];
        if let Some((id, box_)) = self.survivor {
            msg.push(id.owner as i32);
            msg.push(id.seq);
            box_.pack_into(&mut msg);
        }
        msg
    }

    pub fn decode(dim: usize, msg: &[i32]) -> Result<Self, ClusterError> {
        let acceptance = BoxAcceptance::from_code(msg[0])?;
        let subtree_boxes = msg[1].clamp(0, 2) as u8;
        let survivor = if subtree_boxes == 1 {
            let id = BoxId {
                owner: msg[2] as usize,
                seq: msg[3],
            };
            let (box_, _) = IndexBox::unpack(dim, &msg[4..]);
            Some((id, box_))
        } else {
            None
        };
        Ok(Self {
            acceptance,
            subtree_boxes,
            survivor,
        })
    }
}

/// One proposed relationship, sent to the owner of the output box.
pub(crate) struct RelationshipEntry {
    /// Sequence number of the receiver-owned output box.
    pub new_seq: i32,
    pub tag_id: BoxId,
    pub tag_box: IndexBox,
}

/// All relationships one rank proposes to one output-box owner.
#[derive(Default)]
pub(crate) struct RelationshipBatch {
    pub entries: Vec<RelationshipEntry>,
}

impl RelationshipBatch {
    pub fn encode(&self) -> Vec<i32> {
        let mut msg = vec![self.entries.len() as i32];
        for entry in &self.entries {
            msg.push(entry.new_seq);
            msg.push(entry.tag_id.owner as i32);
            msg.push(entry.tag_id.seq);
            entry.tag_box.pack_into(&mut msg);
        }
        msg
    }

    pub fn decode(dim: usize, msg: &[i32]) -> Result<Self, ClusterError> {
        let count = msg[0] as usize;
        let entry_len = 3 + 2 * dim;
        if msg.len() != 1 + count * entry_len {
            return Err(ClusterError::invariant(
                "malformed relationship message",
            ));
        }
        let mut entries = Vec::with_capacity(count);
        let mut rest = &msg[1..];
        for _ in 0..count {
            let tag_id = BoxId {
                owner: rest[1] as usize,
                seq: rest[2],
            };
            let (tag_box, tail) = IndexBox::unpack(dim, &rest[3..]);
            entries.push(RelationshipEntry {
                new_seq: rest[0],
                tag_id,
                tag_box,
            });
            rest = tail;
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::IntVector;

    fn box2(lo: [i32; 2], hi: [i32; 2]) -> IndexBox {
        IndexBox::new(IntVector::new(&lo), IntVector::new(&hi))
    }

    #[test]
    fn test_acceptability_with_children() {
        let msg = Acceptability {
            acceptance: BoxAcceptance::RejectedByCalculation,
            num_tags: 42,
            box_: box2([0, 0], [9, 9]),
            child_boxes: Some((box2([0, 0], [4, 9]), box2([5, 0], [9, 9]))),
        };
        let decoded = Acceptability::decode(2, &msg.encode()).unwrap();
        assert_eq!(decoded.acceptance, BoxAcceptance::RejectedByCalculation);
        assert_eq!(decoded.num_tags, 42);
        assert_eq!(decoded.box_, msg.box_);
        assert_eq!(decoded.child_boxes, msg.child_boxes);
    }

    #[test]
    fn test_child_groups_carry_uneven_groups() {
        let msg = ChildGroups {
            left: ChildAssignment {
                box_: box2([0, 0], [4, 9]),
                owner: 3,
                tag: 17,
                group: vec![1, 3],
            },
            right: ChildAssignment {
                box_: box2([5, 0], [9, 9]),
                owner: 0,
                tag: 18,
                group: vec![0, 2, 4],
            },
        };
        let decoded = ChildGroups::decode(2, &msg.encode()).unwrap();
        assert_eq!(decoded.left.group, vec![1, 3]);
        assert_eq!(decoded.left.tag, 17);
        assert_eq!(decoded.right.owner, 0);
        assert_eq!(decoded.right.group, vec![0, 2, 4]);
    }

    #[test]
    fn test_relationship_batch_rejects_bad_length() {
        let msg = vec![2, 1, 0, 0, 0, 0, 1, 1];
        assert!(RelationshipBatch::decode(2, &msg).is_err());
    }
}
