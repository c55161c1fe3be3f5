use itertools::Itertools;
use nalgebra::{Point2, Vector2};

/// Tolerance used for containment tests, in meters.
///
/// Points this close to an edge count as inside, so that a projected point is
/// always accepted by a subsequent containment check.
const CONTAINS_EPSILON: f32 = 1e-6;

/// A convex polygon in a Z-up plane, stored as counter-clockwise vertices.
///
/// Rebuilt every tick from the current contact points; may degenerate to a
/// line (toe-off, edge contact) or a single point (point contact). All
/// operations remain well-defined on degenerate polygons.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvexPolygon2 {
    vertices: Vec<Point2<f32>>,
}

impl ConvexPolygon2 {
    /// Build the convex hull of `points` using the monotone chain construction.
    #[must_use]
    pub fn from_points(points: &[Point2<f32>]) -> Self {
        let mut sorted: Vec<Point2<f32>> = points.to_vec();
        sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
        sorted.dedup_by(|a, b| (*a - *b).norm_squared() < f32::EPSILON);

        if sorted.len() < 3 {
            return Self { vertices: sorted };
        }

        let mut lower: Vec<Point2<f32>> = Vec::with_capacity(sorted.len());
        for &point in &sorted {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], point) <= 0.0
            {
                lower.pop();
            }
            lower.push(point);
        }

        let mut upper: Vec<Point2<f32>> = Vec::with_capacity(sorted.len());
        for &point in sorted.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], point) <= 0.0
            {
                upper.pop();
            }
            upper.push(point);
        }

        // the endpoints of each chain are the start of the other
        lower.pop();
        upper.pop();
        lower.extend(upper);

        Self { vertices: lower }
    }

    #[must_use]
    pub fn vertices(&self) -> &[Point2<f32>] {
        &self.vertices
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// A polygon with fewer than three vertices has no interior.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.vertices.len() < 3
    }

    /// Area centroid, falling back to the vertex mean for degenerate polygons.
    #[must_use]
    pub fn centroid(&self) -> Point2<f32> {
        if self.is_degenerate() {
            let sum: Vector2<f32> = self.vertices.iter().map(|v| v.coords).sum();
            return Point2::from(sum / (self.vertices.len().max(1) as f32));
        }

        let mut area_sum = 0.0;
        let mut weighted = Vector2::zeros();
        let origin = self.vertices[0];
        for (&a, &b) in self.vertices.iter().skip(1).tuple_windows() {
            let tri_area = cross(origin, a, b);
            area_sum += tri_area;
            weighted += tri_area * (origin.coords + a.coords + b.coords) / 3.0;
        }

        if area_sum.abs() < f32::EPSILON {
            // collinear "polygon" that slipped through hull construction
            let sum: Vector2<f32> = self.vertices.iter().map(|v| v.coords).sum();
            return Point2::from(sum / (self.vertices.len() as f32));
        }

        Point2::from(weighted / area_sum)
    }

    /// Area centroid, or `fallback` when the polygon has no vertices at all.
    #[must_use]
    pub fn centroid_or(&self, fallback: Point2<f32>) -> Point2<f32> {
        if self.is_empty() {
            fallback
        } else {
            self.centroid()
        }
    }

    /// Return whether `point` lies inside the polygon (boundary included).
    #[must_use]
    pub fn contains(&self, point: &Point2<f32>) -> bool {
        match self.vertices.len() {
            0 => false,
            1 | 2 => self.distance_to(point) <= CONTAINS_EPSILON,
            _ => self
                .edges()
                .all(|(a, b)| cross(a, b, *point) >= -CONTAINS_EPSILON),
        }
    }

    /// Distance from `point` to the polygon; zero for points inside.
    #[must_use]
    pub fn distance_to(&self, point: &Point2<f32>) -> f32 {
        (self.orthogonal_projection(point) - point).norm()
    }

    /// Project `point` onto the polygon: the point itself when inside,
    /// otherwise the closest point on the boundary.
    #[must_use]
    pub fn orthogonal_projection(&self, point: &Point2<f32>) -> Point2<f32> {
        match self.vertices.len() {
            0 => *point,
            1 => self.vertices[0],
            2 => closest_point_on_segment(self.vertices[0], self.vertices[1], *point),
            _ => {
                if self
                    .edges()
                    .all(|(a, b)| cross(a, b, *point) >= -CONTAINS_EPSILON)
                {
                    return *point;
                }

                self.edges()
                    .map(|(a, b)| closest_point_on_segment(a, b, *point))
                    .min_by(|p, q| {
                        (p - point)
                            .norm_squared()
                            .total_cmp(&(q - point).norm_squared())
                    })
                    .unwrap_or(*point)
            }
        }
    }

    /// Move `point` the given fraction of the way towards the centroid.
    ///
    /// A fraction of 0.10 keeps the stand target safely interior to the
    /// support polygon instead of balancing on its boundary.
    #[must_use]
    pub fn pull_towards_centroid(&self, point: &Point2<f32>, fraction: f32) -> Point2<f32> {
        let centroid = self.centroid();
        point + (centroid - point) * fraction.clamp(0.0, 1.0)
    }

    fn edges(&self) -> impl Iterator<Item = (Point2<f32>, Point2<f32>)> + '_ {
        self.vertices
            .iter()
            .copied()
            .circular_tuple_windows::<(_, _)>()
    }
}

/// 2D cross product of the edges `ab` and `ac`; positive when `c` is to the
/// left of `ab`.
fn cross(a: Point2<f32>, b: Point2<f32>, c: Point2<f32>) -> f32 {
    let ab = b - a;
    let ac = c - a;
    ab.x * ac.y - ab.y * ac.x
}

fn closest_point_on_segment(a: Point2<f32>, b: Point2<f32>, point: Point2<f32>) -> Point2<f32> {
    let ab = b - a;
    let length_squared = ab.norm_squared();
    if length_squared < f32::EPSILON {
        return a;
    }

    let t = ((point - a).dot(&ab) / length_squared).clamp(0.0, 1.0);
    a + ab * t
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, point};

    use super::ConvexPolygon2;

    fn unit_square() -> ConvexPolygon2 {
        ConvexPolygon2::from_points(&[
            point![0.0, 0.0],
            point![1.0, 0.0],
            point![1.0, 1.0],
            point![0.0, 1.0],
            // interior point must not survive hull construction
            point![0.5, 0.5],
        ])
    }

    #[test]
    fn hull_discards_interior_points() {
        let square = unit_square();
        assert_eq!(square.len(), 4);
        assert!(!square.is_degenerate());
    }

    #[test]
    fn centroid_of_square() {
        let centroid = unit_square().centroid();
        assert!((centroid - point![0.5, 0.5]).norm() < 1e-6);
    }

    #[test]
    fn contains_boundary_and_interior() {
        let square = unit_square();
        assert!(square.contains(&point![0.5, 0.5]));
        assert!(square.contains(&point![0.0, 0.5]));
        assert!(!square.contains(&point![1.2, 0.5]));
    }

    #[test]
    fn projection_is_identity_inside_and_clamps_outside() {
        let square = unit_square();
        assert_eq!(square.orthogonal_projection(&point![0.3, 0.4]), point![0.3, 0.4]);

        let projected = square.orthogonal_projection(&point![2.0, 0.5]);
        assert!((projected - point![1.0, 0.5]).norm() < 1e-6);
        assert!(square.contains(&projected));
    }

    #[test]
    fn distance_to_line_polygon() {
        let line = ConvexPolygon2::from_points(&[point![0.0, 0.0], point![1.0, 0.0]]);
        assert!(line.is_degenerate());
        assert!((line.distance_to(&point![0.5, 0.2]) - 0.2).abs() < 1e-6);
        assert!((line.distance_to(&point![2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pull_towards_centroid_is_fractional() {
        let square = unit_square();
        let pulled = square.pull_towards_centroid(&point![1.0, 0.5], 0.10);
        assert!((pulled - Point2::new(0.95, 0.5)).norm() < 1e-6);
    }
}
