use nalgebra::{Point2, Vector2};

/// Shortest double-support plan we will fit a polynomial over, in seconds.
const MINIMUM_DURATION: f32 = 1e-3;

/// Five-coefficient polynomial trajectory `x(t) = c0 + c1·t + c3·t³ + c4·t⁴`.
///
/// The quadratic coefficient is pinned to zero so the trajectory starts with
/// zero acceleration: together with matched boundary positions and velocities
/// this gives the five conditions the five coefficients can satisfy.
#[derive(Debug, Clone, Copy)]
pub struct QuarticTrajectory {
    c0: f32,
    c1: f32,
    c3: f32,
    c4: f32,
    duration: f32,
}

impl QuarticTrajectory {
    #[must_use]
    pub fn new(duration: f32, x0: f32, v0: f32, xf: f32, vf: f32) -> Self {
        if duration < MINIMUM_DURATION {
            // degenerate plan, hold the target
            return Self {
                c0: xf,
                c1: 0.0,
                c3: 0.0,
                c4: 0.0,
                duration: MINIMUM_DURATION,
            };
        }

        let a = xf - x0 - v0 * duration;
        let b = vf - v0;

        Self {
            c0: x0,
            c1: v0,
            c3: (4.0 * a - b * duration) / duration.powi(3),
            c4: (b * duration - 3.0 * a) / duration.powi(4),
            duration,
        }
    }

    #[must_use]
    pub fn duration(&self) -> f32 {
        self.duration
    }

    #[must_use]
    pub fn position(&self, time: f32) -> f32 {
        let t = time.clamp(0.0, self.duration);
        self.c0 + self.c1 * t + self.c3 * t.powi(3) + self.c4 * t.powi(4)
    }

    #[must_use]
    pub fn velocity(&self, time: f32) -> f32 {
        if time > self.duration {
            return 0.0;
        }

        let t = time.max(0.0);
        self.c1 + 3.0 * self.c3 * t.powi(2) + 4.0 * self.c4 * t.powi(3)
    }
}

/// A planar trajectory built from one [`QuarticTrajectory`] per axis.
#[derive(Debug, Clone, Copy)]
pub struct PlanarTrajectory {
    x: QuarticTrajectory,
    y: QuarticTrajectory,
}

impl PlanarTrajectory {
    #[must_use]
    pub fn new(
        duration: f32,
        initial: Point2<f32>,
        initial_velocity: Vector2<f32>,
        target: Point2<f32>,
        target_velocity: Vector2<f32>,
    ) -> Self {
        Self {
            x: QuarticTrajectory::new(
                duration,
                initial.x,
                initial_velocity.x,
                target.x,
                target_velocity.x,
            ),
            y: QuarticTrajectory::new(
                duration,
                initial.y,
                initial_velocity.y,
                target.y,
                target_velocity.y,
            ),
        }
    }

    #[must_use]
    pub fn duration(&self) -> f32 {
        self.x.duration()
    }

    #[must_use]
    pub fn position(&self, time: f32) -> Point2<f32> {
        Point2::new(self.x.position(time), self.y.position(time))
    }

    #[must_use]
    pub fn velocity(&self, time: f32) -> Vector2<f32> {
        Vector2::new(self.x.velocity(time), self.y.velocity(time))
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, Vector2};

    use super::{PlanarTrajectory, QuarticTrajectory};

    #[test]
    fn boundary_conditions_are_met() {
        let trajectory = QuarticTrajectory::new(0.8, 0.1, 0.3, 0.5, 0.0);

        assert!((trajectory.position(0.0) - 0.1).abs() < 1e-6);
        assert!((trajectory.velocity(0.0) - 0.3).abs() < 1e-6);
        assert!((trajectory.position(0.8) - 0.5).abs() < 1e-5);
        assert!(trajectory.velocity(0.8).abs() < 1e-4);
    }

    #[test]
    fn initial_acceleration_is_zero() {
        let trajectory = QuarticTrajectory::new(0.8, 0.1, 0.3, 0.5, 0.0);
        let dt = 1e-4;
        let acceleration = (trajectory.velocity(dt) - trajectory.velocity(0.0)) / dt;
        assert!(acceleration.abs() < 1e-2);
    }

    #[test]
    fn queries_clamp_outside_the_duration() {
        let trajectory = QuarticTrajectory::new(0.5, 0.0, 0.0, 1.0, 0.0);

        assert!((trajectory.position(2.0) - 1.0).abs() < 1e-5);
        assert_eq!(trajectory.velocity(2.0), 0.0);
        assert!((trajectory.position(-1.0)).abs() < 1e-6);
    }

    #[test]
    fn degenerate_duration_holds_the_target() {
        let trajectory = QuarticTrajectory::new(0.0, 0.3, 1.0, 0.7, 0.0);
        assert_eq!(trajectory.position(0.0), 0.7);
        assert_eq!(trajectory.velocity(0.0), 0.0);
    }

    #[test]
    fn planar_trajectory_tracks_both_axes() {
        let trajectory = PlanarTrajectory::new(
            0.6,
            Point2::new(0.0, 0.1),
            Vector2::zeros(),
            Point2::new(0.2, -0.1),
            Vector2::zeros(),
        );

        let end = trajectory.position(0.6);
        assert!((end - Point2::new(0.2, -0.1)).norm() < 1e-5);
    }
}
