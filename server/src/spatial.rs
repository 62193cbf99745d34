//! Region quadtree over 2D points.
//!
//! Rebuilt every tick from current positions, so it only needs insert,
//! queries and a cheap `clear`. Points carry the caller's id (an entity or
//! collectible slot) so query results map straight back to world state.

/// Default number of points a node holds before splitting
pub const DEFAULT_CAPACITY: usize = 8;
/// Default depth after which nodes stop splitting
pub const DEFAULT_MAX_DEPTH: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPoint {
    pub id: usize,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub point: IndexedPoint,
    pub dist_sq: f32,
}

/// Half-open axis-aligned rectangle `[x, x + w) x [y, y + h)`
#[derive(Debug, Clone, Copy)]
struct Bounds {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl Bounds {
    fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px < self.x + self.w && py >= self.y && py < self.y + self.h
    }

    /// Squared distance from a point to the closest point of the rectangle.
    fn dist_sq_to(&self, px: f32, py: f32) -> f32 {
        let dx = (self.x - px).max(0.0).max(px - (self.x + self.w));
        let dy = (self.y - py).max(0.0).max(py - (self.y + self.h));
        dx * dx + dy * dy
    }

    fn quadrant(&self, index: usize) -> Bounds {
        let hw = self.w / 2.0;
        let hh = self.h / 2.0;
        let col = (index % 2) as f32;
        let row = (index / 2) as f32;
        Bounds {
            x: self.x + col * hw,
            y: self.y + row * hh,
            w: hw,
            h: hh,
        }
    }

    fn quadrant_of(&self, px: f32, py: f32) -> usize {
        let col = (px >= self.x + self.w / 2.0) as usize;
        let row = (py >= self.y + self.h / 2.0) as usize;
        col + row * 2
    }
}

#[derive(Debug)]
struct QuadNode {
    bounds: Bounds,
    depth: u32,
    points: Vec<IndexedPoint>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl QuadNode {
    fn new(bounds: Bounds, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            points: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, point: IndexedPoint, capacity: usize, max_depth: u32) {
        if let Some(children) = self.children.as_mut() {
            let idx = self.bounds.quadrant_of(point.x, point.y);
            children[idx].insert(point, capacity, max_depth);
            return;
        }

        self.points.push(point);
        // Past max depth a leaf takes any number of points, which keeps
        // coincident points from recursing forever.
        if self.points.len() > capacity && self.depth < max_depth {
            self.split(capacity, max_depth);
        }
    }

    fn split(&mut self, capacity: usize, max_depth: u32) {
        let depth = self.depth + 1;
        let b = self.bounds;
        let mut children = Box::new([
            QuadNode::new(b.quadrant(0), depth),
            QuadNode::new(b.quadrant(1), depth),
            QuadNode::new(b.quadrant(2), depth),
            QuadNode::new(b.quadrant(3), depth),
        ]);
        for point in self.points.drain(..) {
            let idx = b.quadrant_of(point.x, point.y);
            children[idx].insert(point, capacity, max_depth);
        }
        self.children = Some(children);
    }

    fn query_circle(&self, cx: f32, cy: f32, r_sq: f32, out: &mut Vec<IndexedPoint>) {
        if self.bounds.dist_sq_to(cx, cy) > r_sq {
            return;
        }
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query_circle(cx, cy, r_sq, out);
            }
        } else {
            out.extend(
                self.points
                    .iter()
                    .filter(|p| blob_shared::vec2::dist_sq(cx, cy, p.x, p.y) <= r_sq),
            );
        }
    }

    fn for_each(&self, f: &mut impl FnMut(&IndexedPoint)) {
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.for_each(f);
            }
        } else {
            self.points.iter().for_each(f);
        }
    }
}

/// Point quadtree covering `[0, width) x [0, height)`.
#[derive(Debug)]
pub struct QuadTree {
    root: QuadNode,
    capacity: usize,
    max_depth: u32,
    len: usize,
    /// Starting radius for the expanding nearest-neighbour search
    initial_radius: f32,
}

impl QuadTree {
    pub fn new(width: f32, height: f32) -> Self {
        Self::with_limits(width, height, DEFAULT_CAPACITY, DEFAULT_MAX_DEPTH)
    }

    pub fn with_limits(width: f32, height: f32, capacity: usize, max_depth: u32) -> Self {
        let bounds = Bounds {
            x: 0.0,
            y: 0.0,
            w: width,
            h: height,
        };
        Self {
            root: QuadNode::new(bounds, 0),
            capacity: capacity.max(1),
            max_depth,
            len: 0,
            initial_radius: width.max(height) / 16.0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every point. The root node and its point buffer are reused.
    pub fn clear(&mut self) {
        self.root.children = None;
        self.root.points.clear();
        self.len = 0;
    }

    /// Insert a point. Points outside the bounds are rejected.
    pub fn insert(&mut self, point: IndexedPoint) -> bool {
        if !self.root.bounds.contains(point.x, point.y) {
            return false;
        }
        self.root.insert(point, self.capacity, self.max_depth);
        self.len += 1;
        true
    }

    /// Collect every point within `radius` of `(cx, cy)` into `out`.
    pub fn query_circle_into(&self, cx: f32, cy: f32, radius: f32, out: &mut Vec<IndexedPoint>) {
        if radius < 0.0 {
            return;
        }
        self.root.query_circle(cx, cy, radius * radius, out);
    }

    pub fn query_circle(&self, cx: f32, cy: f32, radius: f32) -> Vec<IndexedPoint> {
        let mut out = Vec::new();
        self.query_circle_into(cx, cy, radius, &mut out);
        out
    }

    /// Nearest point to `(x, y)`, skipping `exclude`.
    ///
    /// Searches circles of doubling radius, so a nearby hit costs a couple of
    /// small queries. Without `max_radius` the search falls back to a full
    /// scan if the expanding rings found nothing.
    pub fn find_nearest(
        &self,
        x: f32,
        y: f32,
        exclude: Option<usize>,
        max_radius: Option<f32>,
    ) -> Option<Nearest> {
        if self.len == 0 {
            return None;
        }
        let b = self.root.bounds;
        let reach = (b.w * b.w + b.h * b.h).sqrt() + b.dist_sq_to(x, y).sqrt();
        let limit = max_radius.unwrap_or(reach).min(reach);

        let mut scratch = Vec::new();
        let mut radius = self.initial_radius.min(limit).max(f32::MIN_POSITIVE);
        loop {
            scratch.clear();
            self.query_circle_into(x, y, radius, &mut scratch);
            // Anything outside the circle is farther than anything inside it,
            // so the closest hit here is the global nearest.
            if let Some(hit) = closest(&scratch, x, y, exclude) {
                return Some(hit);
            }
            if radius >= limit {
                break;
            }
            radius = (radius * 2.0).min(limit);
        }

        if max_radius.is_some() {
            return None;
        }
        let mut best: Option<Nearest> = None;
        self.root.for_each(&mut |p: &IndexedPoint| {
            if Some(p.id) == exclude {
                return;
            }
            let d = blob_shared::vec2::dist_sq(x, y, p.x, p.y);
            if best.map_or(true, |b| d < b.dist_sq) {
                best = Some(Nearest {
                    point: *p,
                    dist_sq: d,
                });
            }
        });
        best
    }
}

fn closest(points: &[IndexedPoint], x: f32, y: f32, exclude: Option<usize>) -> Option<Nearest> {
    points
        .iter()
        .filter(|p| Some(p.id) != exclude)
        .map(|p| Nearest {
            point: *p,
            dist_sq: blob_shared::vec2::dist_sq(x, y, p.x, p.y),
        })
        .min_by(|a, b| a.dist_sq.total_cmp(&b.dist_sq))
}
