//! Tag histograms and the cut heuristics driven by them.
//!
//! A histogram holds, for every dimension of a candidate box, the number
//! of tagged cells projected onto that axis. The owner of a dendrogram
//! node reduces the per-rank histograms, shrinks the box to the tags and
//! picks a cut; the routines here are the local pieces of that work.

use crate::geometry::{IndexBox, IntVector};
use crate::patch::TagPatch;

/// Per-dimension tag counts over a candidate box.
#[derive(Clone, Debug)]
pub struct TagHistogram {
    box_: IndexBox,
    rows: Vec<Vec<i32>>,
}

impl TagHistogram {
    /// Count the locally held tags inside `box_`.
    ///
    /// Every patch intersecting the box contributes; each tagged cell of
    /// the intersection projects onto all axes.
    pub fn local<P: TagPatch>(box_: IndexBox, patches: &[P], tag_val: i32) -> Self {
        let dim = box_.dim();
        let mut rows: Vec<Vec<i32>> = (0..dim)
            .map(|d| vec![0; box_.size(d).max(0) as usize])
            .collect();

        for patch in patches {
            let overlap = patch.index_box().intersect(&box_);
            if overlap.is_empty() {
                continue;
            }
            for cell in overlap.cells() {
                if patch.tag(&cell) == tag_val {
                    for (d, row) in rows.iter_mut().enumerate() {
                        row[(cell[d] - box_.lower()[d]) as usize] += 1;
                    }
                }
            }
        }

        Self { box_, rows }
    }

    /// Rebuild a histogram from a reduction buffer laid out as the
    /// concatenation of the per-dimension rows.
    pub fn from_buffer(box_: IndexBox, buf: &[i32]) -> Self {
        let mut rows = Vec::with_capacity(box_.dim());
        let mut rest = buf;
        for d in 0..box_.dim() {
            let (row, tail) = rest.split_at(box_.size(d).max(0) as usize);
            rows.push(row.to_vec());
            rest = tail;
        }
        debug_assert!(rest.is_empty());
        Self { box_, rows }
    }

    /// Flatten the rows into a reduction buffer.
    pub fn to_buffer(&self) -> Vec<i32> {
        self.rows.iter().flatten().copied().collect()
    }

    /// Return the box the histogram was built over.
    pub fn index_box(&self) -> IndexBox {
        self.box_
    }

    /// Return the counts along dimension `d`.
    pub fn row(&self, d: usize) -> &[i32] {
        &self.rows[d]
    }

    /// Return the total number of tags in the box.
    ///
    /// Every row sums to the same total; the first is used.
    pub fn num_tags(&self) -> i64 {
        self.rows
            .first()
            .map(|row| row.iter().map(|&c| c as i64).sum())
            .unwrap_or(0)
    }

    /// Return the minimal box containing all tags, or `None` if the
    /// histogram is empty.
    pub fn tag_bounds(&self) -> Option<IndexBox> {
        let mut lo = self.box_.lower();
        let mut hi = self.box_.upper();
        for d in 0..self.box_.dim() {
            let row = &self.rows[d];
            let first = row.iter().position(|&c| c != 0)?;
            let last = row.iter().rposition(|&c| c != 0)?;
            lo[d] = self.box_.lower()[d] + first as i32;
            hi[d] = self.box_.lower()[d] + last as i32;
        }
        Some(IndexBox::new(lo, hi))
    }

    /// Return the box shrunk to the tags, never below the `min_box` floor
    /// in a dimension (unless the box was already smaller), and never
    /// outside the original box.
    pub fn shrunk_to_tags(&self, min_box: &IntVector) -> Option<IndexBox> {
        let bounds = self.tag_bounds()?;
        let mut lo = bounds.lower();
        let mut hi = bounds.upper();
        for d in 0..self.box_.dim() {
            let floor = min_box[d].min(self.box_.size(d));
            let mut shortfall = floor - (hi[d] - lo[d] + 1);
            if shortfall <= 0 {
                continue;
            }
            // Grow symmetrically, clamped to the original box.
            let down = (shortfall / 2).min(lo[d] - self.box_.lower()[d]);
            lo[d] -= down;
            shortfall -= down;
            hi[d] += shortfall.min(self.box_.upper()[d] - hi[d]);
        }
        Some(IndexBox::new(lo, hi))
    }

    /// Restrict the histogram to a sub-box by slicing the rows.
    pub fn restrict(&self, sub: &IndexBox) -> TagHistogram {
        let rows = (0..self.box_.dim())
            .map(|d| {
                let start = (sub.lower()[d] - self.box_.lower()[d]) as usize;
                self.rows[d][start..start + sub.size(d) as usize].to_vec()
            })
            .collect();
        TagHistogram { box_: *sub, rows }
    }
}

/// A chosen cut: the box splits before coordinate `cut` along `dim`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CutPlan {
    /// Dimension to cut.
    pub dim: usize,
    /// First coordinate of the right part.
    pub cut: i32,
}

// The range of legal cut coordinates along dimension d. Cuts keep both
// sides at least min_box wide, except that a dimension violating
// max_box_size may cut anywhere: an oversize output box is a hard failure
// while min_box is advisory.
fn legal_cut_range(
    box_: &IndexBox,
    d: usize,
    min_box: &IntVector,
    max_box_size: &IntVector,
) -> Option<(i32, i32)> {
    let lo = box_.lower()[d];
    let hi = box_.upper()[d];
    let (first, last) = if box_.size(d) > max_box_size[d] {
        (lo + 1, hi)
    } else {
        (lo + min_box[d], hi + 1 - min_box[d])
    };
    if first <= last {
        Some((first, last))
    } else {
        None
    }
}

/// Find the widest swath of zero histogram entries over all splittable
/// dimensions and cut through its center.
///
/// Ties prefer the lower dimension index. Returns `None` when no zero
/// entry lies in any splittable dimension.
pub fn find_zero_cut_swath(
    hist: &TagHistogram,
    min_box: &IntVector,
    max_box_size: &IntVector,
) -> Option<CutPlan> {
    let box_ = hist.index_box();
    let mut best: Option<(i32, CutPlan)> = None;

    for d in 0..box_.dim() {
        let Some((first, last)) = legal_cut_range(&box_, d, min_box, max_box_size) else {
            continue;
        };
        let row = hist.row(d);

        // Scan for runs of zeros.
        let mut run_start: Option<usize> = None;
        for i in 0..=row.len() {
            let zero = i < row.len() && row[i] == 0;
            match (zero, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(start)) => {
                    let width = (i - start) as i32;
                    // Run cells are start..=i-1; cut through the center.
                    let center = box_.lower()[d] + ((start + i) / 2) as i32;
                    let cut = center.clamp(first, last);
                    if best.map(|(w, _)| width > w).unwrap_or(true) {
                        best = Some((width, CutPlan { dim: d, cut }));
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    best.map(|(_, plan)| plan)
}

/// Cut at the strongest inflection of the histogram.
///
/// The discrete Laplacian is scanned for sign changes; the candidate with
/// the largest jump wins, restricted to cuts within the given fraction of
/// the half extent around the box center. Ties prefer the lower dimension,
/// then the lower coordinate. Falls back to a center cut of the most
/// constrained dimension when no sign change qualifies.
pub fn find_laplace_cut(
    hist: &TagHistogram,
    min_box: &IntVector,
    max_box_size: &IntVector,
    max_lap_cut_from_center: f64,
) -> Option<CutPlan> {
    let box_ = hist.index_box();
    let mut best: Option<(i32, CutPlan)> = None;

    for d in 0..box_.dim() {
        let Some((first, last)) = legal_cut_range(&box_, d, min_box, max_box_size) else {
            continue;
        };
        let row = hist.row(d);
        let n = row.len();
        if n < 3 {
            continue;
        }

        let laplacian: Vec<i32> = (1..n - 1)
            .map(|i| row[i - 1] - 2 * row[i] + row[i + 1])
            .collect();

        // Walk the interior and compare consecutive nonzero Laplacian
        // values; a sign change marks an inflection. Zero plateaus between
        // values of opposite sign cut at the plateau center.
        let half_extent = n as f64 / 2.0;
        let window = max_lap_cut_from_center * half_extent;
        let mut prev: Option<(usize, i32)> = None;
        for (offset, &l) in laplacian.iter().enumerate() {
            if l == 0 {
                continue;
            }
            let i = offset + 1;
            if let Some((p, pv)) = prev {
                if pv.signum() != l.signum() {
                    let cut_index = (p + i) / 2 + 1;
                    let cut = box_.lower()[d] + cut_index as i32;
                    let jump = (pv - l).abs();
                    let centered = (cut_index as f64 - half_extent).abs() <= window;
                    if centered && cut >= first && cut <= last {
                        let better = match best {
                            None => true,
                            Some((j, plan)) => {
                                jump > j || (jump == j && d == plan.dim && cut < plan.cut)
                            }
                        };
                        if better {
                            best = Some((jump, CutPlan { dim: d, cut }));
                        }
                    }
                }
            }
            prev = Some((i, l));
        }
    }

    if best.is_some() {
        return best.map(|(_, plan)| plan);
    }

    // No qualifying inflection: cut the most oversized dimension at its
    // center, or the longest splittable one.
    let mut fallback: Option<((i32, i32), CutPlan)> = None;
    for d in 0..box_.dim() {
        let Some((first, last)) = legal_cut_range(&box_, d, min_box, max_box_size) else {
            continue;
        };
        let excess = (box_.size(d) - max_box_size[d]).max(0);
        let score = (excess, box_.size(d));
        let cut = (box_.lower()[d] + box_.size(d) / 2).clamp(first, last);
        if fallback.map(|(s, _)| score > s).unwrap_or(true) {
            fallback = Some((score, CutPlan { dim: d, cut }));
        }
    }
    fallback.map(|(_, plan)| plan)
}

/// Choose a cut for a rejected box: a zero swath if one exists, otherwise
/// the Laplacian heuristic. `None` means the box cannot be split legally.
pub fn choose_cut(
    hist: &TagHistogram,
    min_box: &IntVector,
    max_box_size: &IntVector,
    max_lap_cut_from_center: f64,
) -> Option<CutPlan> {
    find_zero_cut_swath(hist, min_box, max_box_size)
        .or_else(|| find_laplace_cut(hist, min_box, max_box_size, max_lap_cut_from_center))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::patch::Patch;

    fn box1(lo: i32, hi: i32) -> IndexBox {
        IndexBox::new(IntVector::new(&[lo]), IntVector::new(&[hi]))
    }

    fn hist1(lo: i32, counts: &[i32]) -> TagHistogram {
        let box_ = box1(lo, lo + counts.len() as i32 - 1);
        TagHistogram::from_buffer(box_, counts)
    }

    fn ones(dim: usize) -> IntVector {
        IntVector::uniform(dim, 1)
    }

    fn big(dim: usize) -> IntVector {
        IntVector::uniform(dim, 1 << 20)
    }

    #[test]
    fn test_local_histogram_projects_tags() {
        let box_ = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[3, 2]));
        // Tags at (0,0), (0,2), (2,1).
        let patch = Patch::from_fn(box_, |cell| {
            let tagged = matches!((cell[0], cell[1]), (0, 0) | (0, 2) | (2, 1));
            tagged as i32
        });

        let hist = TagHistogram::local(box_, &[patch], 1);
        assert_eq!(hist.num_tags(), 3);
        assert_eq!(hist.row(0), &[2, 0, 1, 0]);
        assert_eq!(hist.row(1), &[1, 1, 1]);
    }

    #[test]
    fn test_patches_outside_the_box_contribute_nothing() {
        let box_ = box1(0, 9);
        let outside = Patch::filled(box1(20, 29), 1);
        let hist = TagHistogram::local(box_, &[outside], 1);
        assert_eq!(hist.num_tags(), 0);
        assert!(hist.tag_bounds().is_none());
    }

    #[test]
    fn test_buffer_round_trip() {
        let box_ = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[1, 2]));
        let patch = Patch::filled(box_, 1);
        let hist = TagHistogram::local(box_, &[patch], 1);
        let rebuilt = TagHistogram::from_buffer(box_, &hist.to_buffer());
        assert_eq!(rebuilt.row(0), hist.row(0));
        assert_eq!(rebuilt.row(1), hist.row(1));
    }

    #[test]
    fn test_shrink_to_tags() {
        let hist = hist1(0, &[0, 0, 3, 1, 2, 0, 0, 0]);
        assert_eq!(hist.tag_bounds(), Some(box1(2, 4)));
        assert_eq!(hist.shrunk_to_tags(&ones(1)), Some(box1(2, 4)));
    }

    #[test]
    fn test_shrink_respects_min_box_floor() {
        let hist = hist1(0, &[0, 0, 0, 5, 0, 0, 0, 0]);
        let shrunk = hist.shrunk_to_tags(&IntVector::new(&[4])).unwrap();
        assert_eq!(shrunk.size(0), 4);
        assert!(shrunk.contains(&IntVector::new(&[3])));
        // Never outside the original box.
        assert_eq!(shrunk, shrunk.intersect(&hist.index_box()));
    }

    #[test]
    fn test_restrict_slices_rows() {
        let hist = hist1(0, &[1, 2, 3, 4, 5]);
        let sub = hist.restrict(&box1(1, 3));
        assert_eq!(sub.row(0), &[2, 3, 4]);
        assert_eq!(sub.index_box(), box1(1, 3));
    }

    #[test]
    fn test_zero_swath_picks_widest_run() {
        let hist = hist1(0, &[4, 0, 3, 0, 0, 0, 2, 1]);
        let plan = find_zero_cut_swath(&hist, &ones(1), &big(1)).unwrap();
        assert_eq!(plan.dim, 0);
        // The widest run is cells 3..=5; the cut goes through its center.
        assert_eq!(plan.cut, 4);
    }

    #[test]
    fn test_zero_swath_requires_a_zero() {
        let hist = hist1(0, &[4, 1, 3, 2]);
        assert!(find_zero_cut_swath(&hist, &ones(1), &big(1)).is_none());
    }

    #[test]
    fn test_laplace_cut_at_plateau_boundary() {
        let hist = hist1(0, &[5, 5, 5, 1, 1, 1, 5, 5, 5]);
        let plan = find_laplace_cut(&hist, &ones(1), &big(1), 1.0).unwrap();
        // Two symmetric inflections tie; the lower coordinate wins.
        assert_eq!(plan, CutPlan { dim: 0, cut: 3 });
    }

    #[test]
    fn test_laplace_window_restricts_candidates() {
        let hist = hist1(0, &[9, 9, 1, 1, 1, 1, 1, 1, 1]);
        // The inflection sits off center and wins with an open window.
        let plan = find_laplace_cut(&hist, &ones(1), &big(1), 1.0).unwrap();
        assert_eq!(plan, CutPlan { dim: 0, cut: 2 });
        // A tight window excludes it and the cut falls back to the center.
        let plan = find_laplace_cut(&hist, &ones(1), &big(1), 0.1).unwrap();
        assert_eq!(plan, CutPlan { dim: 0, cut: 4 });
    }

    #[test]
    fn test_flat_histogram_cuts_at_center() {
        let hist = hist1(0, &[2, 2, 2, 2, 2, 2]);
        let plan = choose_cut(&hist, &ones(1), &big(1), 1.0).unwrap();
        assert_eq!(plan, CutPlan { dim: 0, cut: 3 });
    }

    #[test]
    fn test_min_box_blocks_small_splits() {
        let hist = hist1(0, &[3, 0, 3, 1]);
        assert!(choose_cut(&hist, &IntVector::new(&[3]), &big(1), 1.0).is_none());
    }

    #[test]
    fn test_oversize_overrides_min_box() {
        // Extent 4 with min_box 3 is normally unsplittable, but the box
        // exceeds max_box_size so a cut must be produced.
        let hist = hist1(0, &[3, 0, 3, 1]);
        let max = IntVector::new(&[2]);
        let plan = choose_cut(&hist, &IntVector::new(&[3]), &max, 1.0).unwrap();
        assert!(plan.cut > 0 && plan.cut <= 3);
    }

    #[test]
    fn test_two_dimensional_swath_prefers_wider_run() {
        let box_ = IndexBox::new(IntVector::new(&[0, 0]), IntVector::new(&[8, 8]));
        // Tags in two columns leave a wide vertical gap; rows are fully
        // populated so dimension 1 has no zero run.
        let patch = Patch::from_fn(box_, |cell| (cell[0] <= 1 || cell[0] >= 7) as i32);
        let hist = TagHistogram::local(box_, &[patch], 1);
        let plan = find_zero_cut_swath(&hist, &ones(2), &big(2)).unwrap();
        assert_eq!(plan.dim, 0);
        assert_eq!(plan.cut, 4);
    }
}
