//! Contiguous segments of a series split at change points.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Inclusive.
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    pub mean: f64,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Change of `other`'s mean relative to this segment's mean, in percent.
    pub fn percentage_increase(&self, other: &Segment) -> f64 {
        if self.mean == 0.0 {
            if other.mean == 0.0 { 0.0 } else { f64::INFINITY }
        } else {
            (other.mean - self.mean) * 100.0 / self.mean
        }
    }

    /// Split `data` after each change point. A change point `i` is the index
    /// of the last element of a segment; points outside `0..len-1`, repeats
    /// and unsorted entries are ignored.
    pub fn split(data: &[f64], change_points: &[usize]) -> Vec<Segment> {
        if data.is_empty() {
            return Vec::new();
        }
        let mut segments = Vec::new();
        let mut start = 0;
        for &cp in change_points {
            let end = cp + 1;
            if end <= start || end >= data.len() {
                continue;
            }
            segments.push(Self::over(data, start, end));
            start = end;
        }
        segments.push(Self::over(data, start, data.len()));
        segments
    }

    fn over(data: &[f64], start: usize, end: usize) -> Segment {
        let slice = &data[start..end];
        Segment {
            start,
            end,
            mean: slice.iter().sum::<f64>() / slice.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_change_points_single_segment() {
        let segments = Segment::split(&[1.0, 2.0, 3.0], &[]);
        assert_eq!(segments, vec![Segment { start: 0, end: 3, mean: 2.0 }]);
    }

    #[test]
    fn splits_after_change_point() {
        let data = [10.0, 10.0, 10.0, 40.0, 40.0];
        let segments = Segment::split(&data, &[2]);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], Segment { start: 0, end: 3, mean: 10.0 });
        assert_eq!(segments[1], Segment { start: 3, end: 5, mean: 40.0 });
        assert_eq!(segments[0].percentage_increase(&segments[1]), 300.0);
    }

    #[test]
    fn ignores_out_of_range_and_repeated_points() {
        let data = [1.0, 1.0, 5.0, 5.0];
        let segments = Segment::split(&data, &[1, 1, 3, 7]);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, 2);
    }

    #[test]
    fn empty_data_has_no_segments() {
        assert!(Segment::split(&[], &[0]).is_empty());
    }
}
