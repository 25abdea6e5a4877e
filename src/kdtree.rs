//! A static flat KD-tree over 2-D points.
//!
//! Built once per cluster layer: point ids and interleaved coordinates live
//! in flat arrays that are reordered in place, alternating axes, until every
//! node spans at most `node_size` entries. The median of each node is found
//! with Floyd-Rivest selection, giving linear bulk construction. Queries
//! walk the implicit tree with an explicit stack and report hits through a
//! visitor callback; visit order is unspecified. The index is immutable
//! after build and safe to query concurrently.

#[derive(Clone, Debug, Default)]
pub(crate) struct KdTree {
    node_size: usize,
    ids: Vec<usize>,
    coords: Vec<f64>,
}

impl KdTree {
    /// Bulk-build an index over `points`. Coordinates are captured here;
    /// the caller keeps its own records and receives their indices back
    /// from queries.
    pub fn build<I>(points: I, node_size: usize) -> Self
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        assert!(node_size >= 1, "node_size must be positive");

        let mut ids = Vec::new();
        let mut coords = Vec::new();

        for (i, (x, y)) in points.into_iter().enumerate() {
            ids.push(i);
            coords.push(x);
            coords.push(y);
        }

        let mut tree = KdTree {
            node_size,
            ids,
            coords,
        };

        if tree.ids.len() > 1 {
            tree.sort_range(0, tree.ids.len() - 1, 0);
        }

        tree
    }

    /// Invoke `visit` with the index of every point inside the closed
    /// rectangle `[min_x, max_x] x [min_y, max_y]`.
    pub fn range<F>(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64, mut visit: F)
    where
        F: FnMut(usize),
    {
        if self.ids.is_empty() {
            return;
        }

        let mut stack = vec![(0usize, self.ids.len() - 1, 0u8)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size {
                for i in left..=right {
                    let x = self.coords[2 * i];
                    let y = self.coords[2 * i + 1];

                    if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                        visit(self.ids[i]);
                    }
                }
                continue;
            }

            let m = (left + right) >> 1;
            let x = self.coords[2 * m];
            let y = self.coords[2 * m + 1];

            if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                visit(self.ids[m]);
            }

            if (axis == 0 && min_x <= x) || (axis != 0 && min_y <= y) {
                stack.push((left, m - 1, 1 - axis));
            }
            if (axis == 0 && max_x >= x) || (axis != 0 && max_y >= y) {
                stack.push((m + 1, right, 1 - axis));
            }
        }
    }

    /// Invoke `visit` with the index of every point within Euclidean
    /// distance `r` of `(qx, qy)`.
    pub fn within<F>(&self, qx: f64, qy: f64, r: f64, mut visit: F)
    where
        F: FnMut(usize),
    {
        if self.ids.is_empty() {
            return;
        }

        let r2 = r * r;
        let mut stack = vec![(0usize, self.ids.len() - 1, 0u8)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size {
                for i in left..=right {
                    if sq_dist(self.coords[2 * i], self.coords[2 * i + 1], qx, qy) <= r2 {
                        visit(self.ids[i]);
                    }
                }
                continue;
            }

            let m = (left + right) >> 1;
            let x = self.coords[2 * m];
            let y = self.coords[2 * m + 1];

            if sq_dist(x, y, qx, qy) <= r2 {
                visit(self.ids[m]);
            }

            if (axis == 0 && qx - r <= x) || (axis != 0 && qy - r <= y) {
                stack.push((left, m - 1, 1 - axis));
            }
            if (axis == 0 && qx + r >= x) || (axis != 0 && qy + r >= y) {
                stack.push((m + 1, right, 1 - axis));
            }
        }
    }

    fn sort_range(&mut self, left: usize, right: usize, axis: u8) {
        if right - left <= self.node_size {
            return;
        }

        let m = (left + right) >> 1;

        self.select(m, left, right, axis);

        self.sort_range(left, m - 1, 1 - axis);
        self.sort_range(m + 1, right, 1 - axis);
    }

    /// Partially reorder `[left, right]` so the element at `k` is the
    /// axis-median of the span (Floyd-Rivest selection).
    fn select(&mut self, k: usize, mut left: usize, mut right: usize, axis: u8) {
        let a = axis as usize;

        while right > left {
            if right - left > 600 {
                // Narrow the span around the expected median position
                // before partitioning.
                let n = (right - left + 1) as f64;
                let m = (k - left + 1) as f64;
                let z = n.ln();
                let s = 0.5 * ((2.0 * z) / 3.0).exp();
                let sd = 0.5
                    * ((z * s * (n - s)) / n).sqrt()
                    * if m - n / 2.0 < 0.0 { -1.0 } else { 1.0 };
                let k_f = k as f64;
                let new_left = left.max((k_f - (m * s) / n + sd).floor() as usize);
                let new_right = right.min((k_f + ((n - m) * s) / n + sd).floor() as usize);

                self.select(k, new_left, new_right, axis);
            }

            let t = self.coords[2 * k + a];
            let mut i = left;
            let mut j = right;

            self.swap_item(left, k);
            if self.coords[2 * right + a] > t {
                self.swap_item(left, right);
            }

            while i < j {
                self.swap_item(i, j);
                i += 1;
                j -= 1;

                while self.coords[2 * i + a] < t {
                    i += 1;
                }
                while self.coords[2 * j + a] > t {
                    j -= 1;
                }
            }

            if self.coords[2 * left + a] == t {
                self.swap_item(left, j);
            } else {
                j += 1;
                self.swap_item(j, right);
            }

            if j <= k {
                left = j + 1;
            }
            if k <= j {
                if j == 0 {
                    break;
                }
                right = j - 1;
            }
        }
    }

    fn swap_item(&mut self, i: usize, j: usize) {
        self.ids.swap(i, j);
        self.coords.swap(2 * i, 2 * j);
        self.coords.swap(2 * i + 1, 2 * j + 1);
    }
}

fn sq_dist(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;

    dx * dx + dy * dy
}

#[cfg(test)]
mod tests {
    use super::*;

    const POINTS: [(f64, f64); 100] = [
        (54.0, 1.0),
        (97.0, 21.0),
        (65.0, 35.0),
        (33.0, 54.0),
        (95.0, 39.0),
        (54.0, 3.0),
        (53.0, 54.0),
        (84.0, 72.0),
        (33.0, 34.0),
        (43.0, 15.0),
        (52.0, 83.0),
        (81.0, 23.0),
        (1.0, 61.0),
        (38.0, 74.0),
        (11.0, 91.0),
        (24.0, 56.0),
        (90.0, 31.0),
        (25.0, 57.0),
        (46.0, 61.0),
        (29.0, 69.0),
        (49.0, 60.0),
        (4.0, 98.0),
        (71.0, 15.0),
        (60.0, 25.0),
        (38.0, 84.0),
        (52.0, 38.0),
        (94.0, 51.0),
        (13.0, 25.0),
        (77.0, 73.0),
        (88.0, 87.0),
        (6.0, 27.0),
        (58.0, 22.0),
        (53.0, 28.0),
        (27.0, 91.0),
        (96.0, 98.0),
        (93.0, 14.0),
        (22.0, 93.0),
        (45.0, 94.0),
        (18.0, 28.0),
        (35.0, 15.0),
        (19.0, 81.0),
        (20.0, 81.0),
        (67.0, 53.0),
        (43.0, 3.0),
        (47.0, 66.0),
        (48.0, 34.0),
        (46.0, 12.0),
        (32.0, 38.0),
        (43.0, 12.0),
        (39.0, 94.0),
        (88.0, 62.0),
        (66.0, 14.0),
        (84.0, 30.0),
        (72.0, 81.0),
        (41.0, 92.0),
        (26.0, 4.0),
        (6.0, 76.0),
        (47.0, 21.0),
        (57.0, 70.0),
        (71.0, 82.0),
        (50.0, 68.0),
        (96.0, 18.0),
        (40.0, 31.0),
        (78.0, 53.0),
        (71.0, 90.0),
        (32.0, 14.0),
        (55.0, 6.0),
        (32.0, 88.0),
        (62.0, 32.0),
        (21.0, 67.0),
        (73.0, 81.0),
        (44.0, 64.0),
        (29.0, 50.0),
        (70.0, 5.0),
        (6.0, 22.0),
        (68.0, 3.0),
        (11.0, 23.0),
        (20.0, 42.0),
        (21.0, 73.0),
        (63.0, 86.0),
        (9.0, 40.0),
        (99.0, 2.0),
        (99.0, 76.0),
        (56.0, 77.0),
        (83.0, 6.0),
        (21.0, 72.0),
        (78.0, 30.0),
        (75.0, 53.0),
        (41.0, 11.0),
        (95.0, 20.0),
        (30.0, 38.0),
        (96.0, 82.0),
        (65.0, 48.0),
        (33.0, 18.0),
        (87.0, 28.0),
        (10.0, 10.0),
        (40.0, 34.0),
        (10.0, 20.0),
        (47.0, 29.0),
        (46.0, 78.0),
    ];

    fn build_fixture(node_size: usize) -> KdTree {
        KdTree::build(POINTS.iter().copied(), node_size)
    }

    fn sorted(mut hits: Vec<usize>) -> Vec<usize> {
        hits.sort_unstable();
        hits
    }

    #[test]
    fn test_range_matches_brute_force() {
        let tree = build_fixture(10);
        let (min_x, min_y, max_x, max_y) = (20.0, 30.0, 50.0, 70.0);

        let mut hits = Vec::new();
        tree.range(min_x, min_y, max_x, max_y, |i| hits.push(i));

        let expected: Vec<usize> = POINTS
            .iter()
            .enumerate()
            .filter(|(_, &(x, y))| x >= min_x && x <= max_x && y >= min_y && y <= max_y)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(sorted(hits), sorted(expected));
    }

    #[test]
    fn test_within_matches_brute_force() {
        let tree = build_fixture(10);
        let (qx, qy, r) = (50.0, 50.0, 20.0);

        let mut hits = Vec::new();
        tree.within(qx, qy, r, |i| hits.push(i));

        let expected: Vec<usize> = POINTS
            .iter()
            .enumerate()
            .filter(|(_, &(x, y))| sq_dist(x, y, qx, qy) <= r * r)
            .map(|(i, _)| i)
            .collect();

        assert_eq!(sorted(hits), sorted(expected));
    }

    #[test]
    fn test_small_node_size() {
        // Forces deep recursion through the selection path.
        let tree = build_fixture(1);

        let mut hits = Vec::new();
        tree.range(0.0, 0.0, 100.0, 100.0, |i| hits.push(i));

        assert_eq!(sorted(hits), (0..POINTS.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::build(std::iter::empty(), 64);

        tree.range(0.0, 0.0, 1.0, 1.0, |_| panic!("empty tree visited a point"));
        tree.within(0.5, 0.5, 1.0, |_| panic!("empty tree visited a point"));
    }

    #[test]
    fn test_single_point() {
        let tree = KdTree::build(std::iter::once((0.25, 0.75)), 64);

        let mut hits = Vec::new();
        tree.range(0.0, 0.0, 1.0, 1.0, |i| hits.push(i));
        tree.within(0.25, 0.75, 0.01, |i| hits.push(i));

        assert_eq!(hits, vec![0, 0]);
    }

    #[test]
    fn test_coincident_points() {
        let tree = KdTree::build(std::iter::repeat((0.5, 0.5)).take(8), 2);

        let mut hits = Vec::new();
        tree.within(0.5, 0.5, 0.0, |i| hits.push(i));

        assert_eq!(sorted(hits), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_sq_dist() {
        assert_eq!(sq_dist(10.0, 10.0, 5.0, 5.0), 50.0);
    }
}
