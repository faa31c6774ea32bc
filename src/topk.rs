use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Ranks by probability, then by earlier index.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    prob: f32,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob
            .total_cmp(&other.prob)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// The `k` largest values as `(index, value)`, best first.
///
/// Uses a bounded min-heap instead of sorting the whole slice. Equal values
/// keep the earlier index.
pub fn top_k(data: &[f32], k: usize) -> Vec<(usize, f32)> {
    if k == 0 {
        return Vec::new();
    }

    let mut heap = BinaryHeap::with_capacity(k.min(data.len()));
    for (index, &prob) in data.iter().enumerate() {
        let candidate = Candidate { prob, index };
        if heap.len() < k {
            heap.push(Reverse(candidate));
        } else if let Some(mut worst) = heap.peek_mut() {
            if candidate > worst.0 {
                *worst = Reverse(candidate);
            }
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(c)| (c.index, c.prob))
        .collect()
}

/// Index and value of the largest element; the first one wins ties.
pub fn arg_max(data: &[f32]) -> Option<(usize, f32)> {
    data.iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
}
