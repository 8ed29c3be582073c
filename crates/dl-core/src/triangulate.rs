//! Planar triangulation of pin positions for blend-weight lookup.
//!
//! The domain is seeded with four dummy corner vertices spanning the bounds
//! and split into two triangles. Real points are inserted one at a time:
//! the containing triangle is found by brute-force barycentric test, then
//! either split 4-way across its weakest edge (together with the triangle
//! on the other side) or fanned 3-way. Edges around each new point are
//! legalized with the in-circle test. Once everything is inserted, a
//! settling sweep catches edges the local legalization missed, then a
//! single shorter-diagonal flip pass runs.
//!
//! Real indices exposed by the API are insertion indices; the dummy
//! corners are never visible to callers.

use tracing::warn;

use crate::constants::{BARYCENTRIC_TOLERANCE, DEGENERATE_AREA};
use crate::vector::Vec2;

const DUMMY_COUNT: usize = 4;

/// Points closer than this to an existing vertex are rejected.
const DUPLICATE_DISTANCE: f64 = 1e-6;

/// Axis-aligned rectangle in the triangulation plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds2 {
    pub min: Vec2,
    pub max: Vec2,
}

impl Bounds2 {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Square centered on the origin.
    pub fn square(half_extent: f64) -> Self {
        Self {
            min: Vec2::new(-half_extent, -half_extent),
            max: Vec2::new(half_extent, half_extent),
        }
    }

    /// Strict containment; points on the border are outside.
    pub fn contains(&self, p: Vec2) -> bool {
        p.x > self.min.x && p.x < self.max.x && p.y > self.min.y && p.y < self.max.y
    }
}

/// Up to three real vertices and their blend weights. Unused slots repeat
/// a real index with zero weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interpolant {
    pub idx: [usize; 3],
    pub weights: [f64; 3],
}

impl Interpolant {
    fn single(idx: usize) -> Self {
        Self {
            idx: [idx; 3],
            weights: [1.0, 0.0, 0.0],
        }
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().sum()
    }
}

fn orient(a: Vec2, b: Vec2, c: Vec2) -> f64 {
    (b - a).cross(c - a)
}

/// Positive when `d` lies strictly inside the circumcircle of the
/// counter-clockwise triangle `abc`.
fn in_circle(a: Vec2, b: Vec2, c: Vec2, d: Vec2) -> bool {
    let (ad, bd, cd) = (a - d, b - d, c - d);
    let det = ad.dot(ad) * bd.cross(cd) - bd.dot(bd) * ad.cross(cd) + cd.dot(cd) * ad.cross(bd);
    det > 0.0
}

fn barycentric(a: Vec2, b: Vec2, c: Vec2, p: Vec2) -> Option<[f64; 3]> {
    let area = orient(a, b, c);
    if area.abs() < DEGENERATE_AREA {
        return None;
    }
    let wa = orient(p, b, c) / area;
    let wb = orient(a, p, c) / area;
    Some([wa, wb, 1.0 - wa - wb])
}

/// Rotate a triangle so that `first` leads, keeping the winding.
fn rotate_to(tri: [usize; 3], first: usize) -> [usize; 3] {
    if tri[1] == first {
        [tri[1], tri[2], tri[0]]
    } else if tri[2] == first {
        [tri[2], tri[0], tri[1]]
    } else {
        tri
    }
}

#[derive(Clone, Debug)]
pub struct Triangulator {
    bounds: Bounds2,
    vertices: Vec<Vec2>,
    /// Counter-clockwise vertex triples.
    triangles: Vec<[usize; 3]>,
    /// Real-real edges of triangles touching a dummy corner.
    boundary: Vec<[usize; 2]>,
}

impl Triangulator {
    pub fn new(bounds: Bounds2) -> Self {
        let mut tri = Self {
            bounds,
            vertices: Vec::new(),
            triangles: Vec::new(),
            boundary: Vec::new(),
        };
        tri.clear();
        tri
    }

    pub fn bounds(&self) -> Bounds2 {
        self.bounds
    }

    /// Drop all real points and reseed the corners.
    pub fn clear(&mut self) {
        let Bounds2 { min, max } = self.bounds;
        self.vertices = vec![
            min,
            Vec2::new(max.x, min.y),
            max,
            Vec2::new(min.x, max.y),
        ];
        self.triangles = vec![[0, 1, 2], [0, 2, 3]];
        self.boundary.clear();
    }

    pub fn real_count(&self) -> usize {
        self.vertices.len() - DUMMY_COUNT
    }

    /// Position of a real vertex.
    pub fn point(&self, idx: usize) -> Option<Vec2> {
        self.vertices.get(idx + DUMMY_COUNT).copied()
    }

    /// Triangles whose three vertices are all real, in real indices.
    pub fn real_triangles(&self) -> Vec<[usize; 3]> {
        self.triangles
            .iter()
            .filter(|t| t.iter().all(|&v| v >= DUMMY_COUNT))
            .map(|t| t.map(|v| v - DUMMY_COUNT))
            .collect()
    }

    /// Hull edges of the real point set, in real indices.
    pub fn boundary_edges(&self) -> Vec<[usize; 2]> {
        self.boundary
            .iter()
            .map(|e| e.map(|v| v - DUMMY_COUNT))
            .collect()
    }

    /// Insert points in order. Returns the real index assigned to each
    /// input, or `None` where the point was rejected.
    pub fn add_points(&mut self, points: &[Vec2]) -> Vec<Option<usize>> {
        let assigned = points.iter().map(|&p| self.insert(p)).collect();
        self.settle();
        self.flip_pass();
        self.rebuild_boundary();
        assigned
    }

    /// Blend weights for a query position.
    ///
    /// `None` with no real points. A position covered by a real triangle
    /// gets non-negative barycentric weights; anything else is projected
    /// onto the nearest boundary edge.
    pub fn find(&self, p: Vec2) -> Option<Interpolant> {
        match self.real_count() {
            0 => return None,
            1 => return Some(Interpolant::single(0)),
            _ => {}
        }
        if let Some(hit) = self.find_interior(p) {
            return Some(hit);
        }
        self.find_boundary(p).or_else(|| self.find_nearest(p))
    }

    fn find_interior(&self, p: Vec2) -> Option<Interpolant> {
        for t in self
            .triangles
            .iter()
            .filter(|t| t.iter().all(|&v| v >= DUMMY_COUNT))
        {
            let [a, b, c] = t.map(|v| self.vertices[v]);
            let Some(w) = barycentric(a, b, c, p) else {
                continue;
            };
            if w.iter().all(|&x| x >= -BARYCENTRIC_TOLERANCE) {
                let clamped = w.map(|x| x.max(0.0));
                let sum: f64 = clamped.iter().sum();
                return Some(Interpolant {
                    idx: t.map(|v| v - DUMMY_COUNT),
                    weights: clamped.map(|x| x / sum),
                });
            }
        }
        None
    }

    fn find_boundary(&self, p: Vec2) -> Option<Interpolant> {
        let mut best: Option<(f64, usize, usize, f64)> = None;
        for &[ia, ib] in &self.boundary {
            let (a, b) = (self.vertices[ia], self.vertices[ib]);
            let ab = b - a;
            let len2 = ab.dot(ab);
            let t = if len2 > 0.0 {
                ((p - a).dot(ab) / len2).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let d = p.distance(a + ab * t);
            if best.is_none_or(|(bd, ..)| d < bd) {
                best = Some((d, ia, ib, t));
            }
        }
        best.map(|(_, ia, ib, t)| {
            let (a, b) = (ia - DUMMY_COUNT, ib - DUMMY_COUNT);
            Interpolant {
                idx: [a, b, a],
                weights: [1.0 - t, t, 0.0],
            }
        })
    }

    fn find_nearest(&self, p: Vec2) -> Option<Interpolant> {
        self.vertices[DUMMY_COUNT..]
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.distance(p).total_cmp(&b.1.distance(p)))
            .map(|(i, _)| Interpolant::single(i))
    }

    fn insert(&mut self, p: Vec2) -> Option<usize> {
        if !(p.x.is_finite() && p.y.is_finite()) || !self.bounds.contains(p) {
            warn!(x = p.x, y = p.y, "point outside triangulation bounds, skipped");
            return None;
        }
        if self.vertices[DUMMY_COUNT..]
            .iter()
            .any(|v| v.distance(p) < DUPLICATE_DISTANCE)
        {
            warn!(x = p.x, y = p.y, "point coincides with an existing vertex, skipped");
            return None;
        }
        let Some((t, weights)) = self.locate(p) else {
            warn!(x = p.x, y = p.y, "no containing triangle, skipped");
            return None;
        };

        let pi = self.vertices.len();
        self.vertices.push(p);

        // Weakest vertex first: the edge opposite it is the one p leans on.
        let weakest = (0..3)
            .min_by(|&i, &j| weights[i].total_cmp(&weights[j]))
            .unwrap_or(0);
        let [a, b, c] = rotate_to(self.triangles[t], self.triangles[t][weakest]);

        let split = self.opposite(b, c).filter(|&(_, d)| {
            [[a, b, pi], [b, d, pi], [d, c, pi], [c, a, pi]]
                .iter()
                .all(|tri| self.area(*tri) > DEGENERATE_AREA)
        });

        let mut stack = Vec::with_capacity(4);
        match split {
            Some((n, d)) => {
                self.triangles[t] = [a, b, pi];
                self.triangles[n] = [b, d, pi];
                self.triangles.push([d, c, pi]);
                self.triangles.push([c, a, pi]);
                stack.extend([(a, b), (b, d), (d, c), (c, a)]);
            }
            None => {
                self.triangles[t] = [a, b, pi];
                self.triangles.push([b, c, pi]);
                self.triangles.push([c, a, pi]);
                stack.extend([(a, b), (b, c), (c, a)]);
            }
        }
        self.legalize(pi, stack);
        Some(pi - DUMMY_COUNT)
    }

    /// Most-interior triangle containing `p`.
    fn locate(&self, p: Vec2) -> Option<(usize, [f64; 3])> {
        self.triangles
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                let [a, b, c] = t.map(|v| self.vertices[v]);
                barycentric(a, b, c, p).map(|w| (i, w))
            })
            .filter(|(_, w)| w.iter().all(|&x| x >= -BARYCENTRIC_TOLERANCE))
            .max_by(|x, y| {
                let mx = x.1.iter().copied().fold(f64::INFINITY, f64::min);
                let my = y.1.iter().copied().fold(f64::INFINITY, f64::min);
                mx.total_cmp(&my)
            })
    }

    fn area(&self, t: [usize; 3]) -> f64 {
        orient(self.vertices[t[0]], self.vertices[t[1]], self.vertices[t[2]])
    }

    /// Triangle on the far side of directed edge `u -> v`, and its apex.
    fn opposite(&self, u: usize, v: usize) -> Option<(usize, usize)> {
        self.triangles.iter().enumerate().find_map(|(i, t)| {
            (0..3).find_map(|k| (t[k] == v && t[(k + 1) % 3] == u).then_some((i, t[(k + 2) % 3])))
        })
    }

    fn index_of(&self, tri: [usize; 3]) -> Option<usize> {
        self.triangles
            .iter()
            .position(|t| (0..3).any(|k| rotate_to(*t, t[k]) == tri))
    }

    /// Replace the triangles `(u, v, w)` and `(v, u, x)` by `(w, u, x)` and
    /// `(x, v, w)`.
    fn flip(&mut self, t1: usize, t2: usize, u: usize, v: usize, w: usize, x: usize) {
        self.triangles[t1] = [w, u, x];
        self.triangles[t2] = [x, v, w];
    }

    fn is_convex(&self, u: usize, v: usize, w: usize, x: usize) -> bool {
        self.area([w, u, x]) > DEGENERATE_AREA && self.area([x, v, w]) > DEGENERATE_AREA
    }

    /// Restore the empty-circumcircle property around a new vertex.
    /// Each stacked edge `u -> v` belongs to triangle `(u, v, p)`.
    fn legalize(&mut self, p: usize, mut stack: Vec<(usize, usize)>) {
        let mut budget = 64 * self.triangles.len();
        while let Some((u, v)) = stack.pop() {
            if budget == 0 {
                warn!("edge legalization did not settle");
                return;
            }
            budget -= 1;
            let Some(t1) = self.index_of([u, v, p]) else {
                continue;
            };
            let Some((t2, x)) = self.opposite(u, v) else {
                continue;
            };
            let [pu, pv, pp, px] = [u, v, p, x].map(|i| self.vertices[i]);
            if in_circle(pu, pv, pp, px) && self.is_convex(u, v, p, x) {
                self.flip(t1, t2, u, v, p, x);
                stack.push((u, x));
                stack.push((x, v));
            }
        }
    }

    /// Sweep all edges with the in-circle test until none flips.
    fn settle(&mut self) {
        let mut sweeps = 4 * self.triangles.len();
        loop {
            let mut flipped = false;
            for i in 0..self.triangles.len() {
                for k in 0..3 {
                    let t = self.triangles[i];
                    let (u, v, w) = (t[k], t[(k + 1) % 3], t[(k + 2) % 3]);
                    let Some((j, x)) = self.opposite(u, v) else {
                        continue;
                    };
                    let [pu, pv, pw, px] = [u, v, w, x].map(|i| self.vertices[i]);
                    if in_circle(pu, pv, pw, px) && self.is_convex(u, v, w, x) {
                        self.flip(i, j, u, v, w, x);
                        flipped = true;
                        break;
                    }
                }
            }
            if !flipped {
                return;
            }
            if sweeps == 0 {
                warn!("triangulation did not settle");
                return;
            }
            sweeps -= 1;
        }
    }

    /// One pass swapping any convex quad's diagonal for the shorter one.
    fn flip_pass(&mut self) {
        for i in 0..self.triangles.len() {
            for k in 0..3 {
                let t = self.triangles[i];
                let (u, v, w) = (t[k], t[(k + 1) % 3], t[(k + 2) % 3]);
                let Some((j, x)) = self.opposite(u, v) else {
                    continue;
                };
                let current = self.vertices[u].distance(self.vertices[v]);
                let cross = self.vertices[w].distance(self.vertices[x]);
                if cross < current && self.is_convex(u, v, w, x) {
                    self.flip(i, j, u, v, w, x);
                    break;
                }
            }
        }
    }

    fn rebuild_boundary(&mut self) {
        let mut edges: Vec<[usize; 2]> = Vec::new();
        for t in &self.triangles {
            if !t.iter().any(|&v| v < DUMMY_COUNT) {
                continue;
            }
            for k in 0..3 {
                let (u, v) = (t[k], t[(k + 1) % 3]);
                if u >= DUMMY_COUNT && v >= DUMMY_COUNT {
                    let edge = [u.min(v), u.max(v)];
                    if !edges.contains(&edge) {
                        edges.push(edge);
                    }
                }
            }
        }
        self.boundary = edges;
    }
}
