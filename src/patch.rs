//! Access to per-cell tag data on local patches.

use crate::geometry::{IndexBox, IntVector};

/// Read access to the tag field of one patch.
///
/// The clustering engine never sees patch storage directly; it only asks
/// for the index box and for individual cell values. Any level
/// representation can participate by implementing this trait.
pub trait TagPatch {
    /// Return the index box covered by the patch.
    fn index_box(&self) -> IndexBox;

    /// Return the tag value of a cell inside the patch box.
    fn tag(&self, cell: &IntVector) -> i32;
}

/// A patch owning its tag field in a row-major array.
#[derive(Clone, Debug)]
pub struct Patch {
    box_: IndexBox,
    data: Vec<i32>,
}

impl Patch {
    /// Create a patch with every cell set to `value`.
    pub fn filled(box_: IndexBox, value: i32) -> Self {
        Self {
            data: vec![value; box_.volume() as usize],
            box_,
        }
    }

    /// Create a patch with cell values produced by `f`.
    pub fn from_fn(box_: IndexBox, mut f: impl FnMut(&IntVector) -> i32) -> Self {
        let data = box_.cells().map(|cell| f(&cell)).collect();
        Self { box_, data }
    }

    /// Set the tag value of a cell.
    pub fn set_tag(&mut self, cell: &IntVector, value: i32) {
        let offset = self.offset(cell);
        self.data[offset] = value;
    }

    // Row-major offset with the last dimension fastest, matching the cell
    // iteration order of IndexBox.
    fn offset(&self, cell: &IntVector) -> usize {
        debug_assert!(self.box_.contains(cell));
        let mut offset = 0_usize;
        for d in 0..self.box_.dim() {
            offset = offset * self.box_.size(d) as usize
                + (cell[d] - self.box_.lower()[d]) as usize;
        }
        offset
    }
}

impl TagPatch for Patch {
    fn index_box(&self) -> IndexBox {
        self.box_
    }

    fn tag(&self, cell: &IntVector) -> i32 {
        self.data[self.offset(cell)]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offsets_follow_cell_order() {
        let box_ = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[2, 3]));
        let patch = Patch::from_fn(box_, |cell| cell[0] * 10 + cell[1]);

        for cell in box_.cells() {
            assert_eq!(patch.tag(&cell), cell[0] * 10 + cell[1]);
        }
    }

    #[test]
    fn test_set_tag() {
        let box_ = IndexBox::new(IntVector::new(&[-1, -1]), IntVector::new(&[1, 1]));
        let mut patch = Patch::filled(box_, 0);
        let cell = IntVector::new(&[0, 1]);
        patch.set_tag(&cell, 7);
        assert_eq!(patch.tag(&cell), 7);
        assert_eq!(patch.tag(&IntVector::new(&[0, 0])), 0);
    }
}
