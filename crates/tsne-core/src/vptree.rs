//! Vantage-point tree for exact nearest-neighbor search in input space.
//!
//! Nodes live in a flat arena. Each node splits its remaining points at the
//! median distance from a randomly chosen vantage point: the inside subtree
//! holds points within `threshold`, the outside subtree the rest.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ndarray::ArrayView1;
use rand::Rng;
use rayon::prelude::*;

use crate::matrix::{Matrix, squared_distance};

const NONE: usize = usize::MAX;

/// A search hit: Euclidean distance to the query and the point index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
struct VpNode {
    index: usize,
    threshold: f64,
    inside: usize,
    outside: usize,
}

pub struct VpTree<'a> {
    data: &'a Matrix,
    nodes: Vec<VpNode>,
    root: usize,
}

impl<'a> VpTree<'a> {
    pub fn build(data: &'a Matrix, rng: &mut impl Rng) -> Self {
        let mut items: Vec<usize> = (0..data.rows()).collect();
        let mut tree = Self {
            data,
            nodes: Vec::with_capacity(data.rows()),
            root: NONE,
        };
        tree.root = tree.build_range(&mut items, rng);
        tree
    }

    fn build_range(&mut self, items: &mut [usize], rng: &mut impl Rng) -> usize {
        if items.is_empty() {
            return NONE;
        }
        let pick = rng.random_range(0..items.len());
        items.swap(0, pick);
        let vantage = items[0];
        let data = self.data;
        let vantage_row = data.row(vantage);

        let id = self.nodes.len();
        self.nodes.push(VpNode {
            index: vantage,
            threshold: 0.0,
            inside: NONE,
            outside: NONE,
        });

        let rest = &mut items[1..];
        if rest.is_empty() {
            return id;
        }

        let median = rest.len() / 2;
        rest.select_nth_unstable_by(median, |&a, &b| {
            squared_distance(vantage_row, data.row(a))
                .total_cmp(&squared_distance(vantage_row, data.row(b)))
        });
        let threshold = squared_distance(vantage_row, data.row(rest[median])).sqrt();

        let (inside, outside) = rest.split_at_mut(median);
        let inside_id = self.build_range(inside, rng);
        let outside_id = self.build_range(outside, rng);

        let node = &mut self.nodes[id];
        node.threshold = threshold;
        node.inside = inside_id;
        node.outside = outside_id;
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The `k` nearest points to `target`, ascending by distance.
    /// `skip` excludes one index (the query point itself) by identity,
    /// so exact duplicates of the query still count as neighbors.
    pub fn search(
        &self,
        target: ArrayView1<'_, f64>,
        skip: Option<usize>,
        k: usize,
    ) -> Vec<Neighbor> {
        if k == 0 || self.root == NONE {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        let mut tau = f64::INFINITY;
        let mut stack = vec![self.root];

        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            let dist = squared_distance(target, self.data.row(node.index)).sqrt();

            if Some(node.index) != skip && (heap.len() < k || dist < tau) {
                heap.push(Neighbor {
                    index: node.index,
                    distance: dist,
                });
                if heap.len() > k {
                    heap.pop();
                }
                if heap.len() == k
                    && let Some(worst) = heap.peek()
                {
                    tau = worst.distance;
                }
            }

            // Push the less promising side first so the closer one pops next.
            let (near, far) = if dist < node.threshold {
                (node.inside, node.outside)
            } else {
                (node.outside, node.inside)
            };
            if far != NONE && (dist - node.threshold).abs() <= tau {
                stack.push(far);
            }
            if near != NONE {
                stack.push(near);
            }
        }

        heap.into_sorted_vec()
    }

    /// K nearest neighbors of every indexed point, excluding itself.
    pub fn knn_all(&self, k: usize) -> Vec<Vec<Neighbor>> {
        (0..self.data.rows())
            .into_par_iter()
            .map(|i| self.search(self.data.row(i), Some(i), k))
            .collect()
    }
}
