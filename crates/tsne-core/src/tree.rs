//! Barnes-Hut space-partitioning tree over the embedding (quadtree in 2-D,
//! octree in 3-D).
//!
//! Nodes live in an arena addressed by [`NodeId`]. Building partitions a
//! permutation of the point indices in place, so every node owns a
//! contiguous `start..end` range of it. Mass and centroid are aggregated
//! bottom-up once the children exist. The arena and permutation buffers are
//! reused by [`SpaceTree::rebuild`], which the optimizer calls every
//! iteration: the tree always reflects the current positions.

use crate::constants::{MAX_CHILDREN, MAX_EMBED_DIMS, MAX_TREE_DEPTH};
use crate::embedding::Embedding;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    center: [f64; MAX_EMBED_DIMS],
    half_width: f64,
    centroid: [f64; MAX_EMBED_DIMS],
    mass: usize,
    children: [NodeId; MAX_CHILDREN],
    start: usize,
    end: usize,
    leaf: bool,
}

impl Node {
    pub fn center(&self) -> &[f64; MAX_EMBED_DIMS] {
        &self.center
    }

    /// Half the side length of the node's cube.
    pub fn half_width(&self) -> f64 {
        self.half_width
    }

    pub fn centroid(&self) -> &[f64; MAX_EMBED_DIMS] {
        &self.centroid
    }

    /// Number of points in the subtree.
    pub fn mass(&self) -> usize {
        self.mass
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().copied().filter(|c| !c.is_none())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SpaceTree {
    dims: usize,
    nodes: Vec<Node>,
    order: Vec<usize>,
    /// Position of each point index inside `order`.
    slot: Vec<usize>,
}

impl SpaceTree {
    pub fn build(embedding: &Embedding) -> Self {
        let mut tree = Self::default();
        tree.rebuild(embedding);
        tree
    }

    /// Discard the previous partition and index the current positions.
    pub fn rebuild(&mut self, embedding: &Embedding) {
        let n = embedding.n();
        self.dims = embedding.dims();
        self.nodes.clear();
        self.order.clear();
        self.order.extend(0..n);
        if n == 0 {
            self.slot.clear();
            return;
        }

        let coords = embedding.as_slice();
        let mut center = [0.0; MAX_EMBED_DIMS];
        let mut half_width: f64 = 0.0;
        for (d, (lo, hi)) in embedding.bounds().into_iter().enumerate() {
            center[d] = (lo + hi) / 2.0;
            half_width = half_width.max((hi - lo) / 2.0);
        }

        self.build_node(coords, 0, n, center, half_width, 0);

        self.slot.resize(n, 0);
        for (pos, &i) in self.order.iter().enumerate() {
            self.slot[i] = pos;
        }
    }

    fn build_node(
        &mut self,
        coords: &[f64],
        start: usize,
        end: usize,
        center: [f64; MAX_EMBED_DIMS],
        half_width: f64,
        depth: usize,
    ) -> NodeId {
        let dims = self.dims;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            center,
            half_width,
            centroid: [0.0; MAX_EMBED_DIMS],
            mass: 0,
            children: [NodeId::NONE; MAX_CHILDREN],
            start,
            end,
            leaf: true,
        });

        let split = end - start > 1
            && depth < MAX_TREE_DEPTH
            && half_width > 0.0
            && !self.coincident(coords, start, end);

        if !split {
            let mut centroid = [0.0; MAX_EMBED_DIMS];
            for &i in &self.order[start..end] {
                for (c, v) in centroid.iter_mut().zip(point(coords, i, dims)) {
                    *c += v;
                }
            }
            let mass = end - start;
            if mass > 0 {
                centroid.iter_mut().for_each(|c| *c /= mass as f64);
            }
            let node = &mut self.nodes[id.index()];
            node.centroid = centroid;
            node.mass = mass;
            return id;
        }

        self.order[start..end]
            .sort_unstable_by_key(|&i| orthant(point(coords, i, dims), &center));

        let child_half = half_width / 2.0;
        let mut children = [NodeId::NONE; MAX_CHILDREN];
        let mut mass = 0;
        let mut weighted = [0.0; MAX_EMBED_DIMS];
        let mut cursor = start;

        while cursor < end {
            let code = orthant(point(coords, self.order[cursor], dims), &center);
            let mut stop = cursor + 1;
            while stop < end && orthant(point(coords, self.order[stop], dims), &center) == code {
                stop += 1;
            }

            let mut child_center = center;
            for (d, c) in child_center.iter_mut().enumerate().take(dims) {
                if code & (1 << d) != 0 {
                    *c += child_half;
                } else {
                    *c -= child_half;
                }
            }

            let child = self.build_node(coords, cursor, stop, child_center, child_half, depth + 1);
            let node = &self.nodes[child.index()];
            mass += node.mass;
            for (w, c) in weighted.iter_mut().zip(&node.centroid) {
                *w += c * node.mass as f64;
            }
            children[code] = child;
            cursor = stop;
        }

        weighted.iter_mut().for_each(|w| *w /= mass as f64);
        let node = &mut self.nodes[id.index()];
        node.children = children;
        node.mass = mass;
        node.centroid = weighted;
        node.leaf = false;
        id
    }

    fn coincident(&self, coords: &[f64], start: usize, end: usize) -> bool {
        let first = point(coords, self.order[start], self.dims);
        self.order[start + 1..end]
            .iter()
            .all(|&i| point(coords, i, self.dims) == first)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Point indices owned by the subtree rooted at `id`.
    pub fn points(&self, id: NodeId) -> &[usize] {
        let node = self.node(id);
        &self.order[node.start..node.end]
    }

    fn contains(&self, node: &Node, index: usize) -> bool {
        (node.start..node.end).contains(&self.slot[index])
    }

    /// Unnormalized repulsive force on point `index`, written into `force`,
    /// plus this point's share of Z = Σ_j (1 + ‖y_i − y_j‖²)⁻¹.
    ///
    /// A subtree not containing the query is summarized at its centroid when
    /// half-width < θ · distance. Leaves are always summed point by point, so
    /// coincident points contribute to Z but exert no force.
    pub fn accumulate_repulsion(
        &self,
        coords: &[f64],
        index: usize,
        theta: f64,
        force: &mut [f64],
    ) -> f64 {
        force.fill(0.0);
        if self.nodes.is_empty() {
            return 0.0;
        }
        let dims = self.dims;
        let target = point(coords, index, dims);
        let theta_sq = theta * theta;
        let mut sum_q = 0.0;
        let mut stack = Vec::with_capacity(4 * MAX_TREE_DEPTH);
        stack.push(NodeId::ROOT);

        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.index()];
            if node.mass == 0 {
                continue;
            }

            if node.leaf {
                for &j in &self.order[node.start..node.end] {
                    if j == index {
                        continue;
                    }
                    let other = point(coords, j, dims);
                    let q = 1.0 / (1.0 + sq_dist(target, other));
                    sum_q += q;
                    let mult = q * q;
                    for (f, (a, b)) in force.iter_mut().zip(target.iter().zip(other)) {
                        *f += mult * (a - b);
                    }
                }
                continue;
            }

            let centroid = &node.centroid[..dims];
            let dist_sq = sq_dist(target, centroid);
            if !self.contains(node, index) && is_far(node.half_width, dist_sq, theta_sq) {
                let q = 1.0 / (1.0 + dist_sq);
                let mult = node.mass as f64 * q;
                sum_q += mult;
                let mult = mult * q;
                for (f, (a, b)) in force.iter_mut().zip(target.iter().zip(centroid)) {
                    *f += mult * (a - b);
                }
            } else {
                stack.extend(node.children());
            }
        }

        sum_q
    }
}

fn point(coords: &[f64], i: usize, dims: usize) -> &[f64] {
    &coords[i * dims..(i + 1) * dims]
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Child slot of `p` relative to `center`: bit d is set when p[d] ≥ center[d].
fn orthant(p: &[f64], center: &[f64; MAX_EMBED_DIMS]) -> usize {
    p.iter()
        .zip(center)
        .enumerate()
        .fold(0, |code, (d, (v, c))| if v >= c { code | (1 << d) } else { code })
}

/// Barnes-Hut test on the node's half-width, squared on both sides.
fn is_far(half_width: f64, dist_sq: f64, theta_sq: f64) -> bool {
    half_width * half_width < theta_sq * dist_sq
}
