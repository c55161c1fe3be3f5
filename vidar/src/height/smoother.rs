use super::HeightDerivatives;

/// Jerk- and acceleration-limited smoother for the height trajectory.
///
/// A third-order tracking filter: the smoothed state chases the raw input
/// through a bounded jerk, so discontinuities in the raw trajectory (plan
/// switches, re-initializations) never reach the controller as steps.
#[derive(Debug, Clone)]
pub struct HeightSmoother {
    max_acceleration: f32,
    max_jerk: f32,
    dt: f32,
    /// Tracking gains for the height, velocity and acceleration errors.
    gains: (f32, f32, f32),
    state: Option<HeightDerivatives>,
}

impl HeightSmoother {
    #[must_use]
    pub fn new(max_acceleration: f32, max_jerk: f32, bandwidth: f32, dt: f32) -> Self {
        // triple pole at -bandwidth
        let gains = (
            bandwidth.powi(3),
            3.0 * bandwidth.powi(2),
            3.0 * bandwidth,
        );

        Self {
            max_acceleration,
            max_jerk,
            dt,
            gains,
            state: None,
        }
    }

    /// Forget the tracked state; the next input re-seeds the filter.
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn smooth(&mut self, input: HeightDerivatives) -> HeightDerivatives {
        let Some(mut state) = self.state else {
            let seeded = HeightDerivatives {
                height: input.height,
                velocity: input.velocity,
                acceleration: input
                    .acceleration
                    .clamp(-self.max_acceleration, self.max_acceleration),
            };
            self.state = Some(seeded);
            return seeded;
        };

        let (k_height, k_velocity, k_acceleration) = self.gains;
        let jerk = (k_height * (input.height - state.height)
            + k_velocity * (input.velocity - state.velocity)
            + k_acceleration * (input.acceleration - state.acceleration))
            .clamp(-self.max_jerk, self.max_jerk);

        state.acceleration = (state.acceleration + jerk * self.dt)
            .clamp(-self.max_acceleration, self.max_acceleration);
        state.height += state.velocity * self.dt + 0.5 * state.acceleration * self.dt * self.dt;
        state.velocity += state.acceleration * self.dt;

        self.state = Some(state);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::{HeightDerivatives, HeightSmoother};

    #[test]
    fn first_sample_seeds_the_state() {
        let mut smoother = HeightSmoother::new(0.5, 0.5, 6.0, 0.004);
        let input = HeightDerivatives {
            height: 0.8,
            velocity: 0.1,
            acceleration: 3.0,
        };

        let out = smoother.smooth(input);
        assert_eq!(out.height, 0.8);
        assert_eq!(out.velocity, 0.1);
        // acceleration beyond the bound is clamped even when seeding
        assert_eq!(out.acceleration, 0.5);
    }

    #[test]
    fn step_input_is_rate_limited() {
        let mut smoother = HeightSmoother::new(0.5, 0.5, 6.0, 0.004);
        smoother.smooth(HeightDerivatives::default());

        let step = HeightDerivatives {
            height: 0.1,
            velocity: 0.0,
            acceleration: 0.0,
        };

        let out = smoother.smooth(step);
        // one tick later the height has barely moved
        assert!(out.height.abs() < 1e-4);
        assert!(out.acceleration <= 0.5 * 0.004 + 1e-6);
    }

    #[test]
    fn converges_to_a_constant_target() {
        let mut smoother = HeightSmoother::new(0.5, 0.5, 6.0, 0.004);
        let target = HeightDerivatives {
            height: 0.85,
            velocity: 0.0,
            acceleration: 0.0,
        };

        let mut out = HeightDerivatives::default();
        for _ in 0..4000 {
            out = smoother.smooth(target);
        }

        assert!((out.height - 0.85).abs() < 1e-3);
        assert!(out.velocity.abs() < 1e-3);
    }

    #[test]
    fn acceleration_never_exceeds_the_bound() {
        let mut smoother = HeightSmoother::new(0.5, 0.5, 6.0, 0.004);
        smoother.smooth(HeightDerivatives::default());

        let mut max_seen = 0.0_f32;
        for _ in 0..1000 {
            let out = smoother.smooth(HeightDerivatives {
                height: 5.0,
                velocity: 0.0,
                acceleration: 0.0,
            });
            max_seen = max_seen.max(out.acceleration.abs());
        }

        assert!(max_seen <= 0.5 + 1e-6);
    }
}
