use crate::footstep::Footstep;

/// Provides the swing and transfer durations for the current step.
///
/// Defaults come from configuration; footsteps may carry a valid timing
/// override which takes effect when the step is picked up.
#[derive(Debug, Clone)]
pub struct TimingProvider {
    default_swing_time: f32,
    default_transfer_time: f32,
    swing_time: f32,
    transfer_time: f32,
}

impl TimingProvider {
    #[must_use]
    pub fn new(default_swing_time: f32, default_transfer_time: f32) -> Self {
        Self {
            default_swing_time,
            default_transfer_time,
            swing_time: default_swing_time,
            transfer_time: default_transfer_time,
        }
    }

    /// Current swing duration in seconds.
    #[must_use]
    pub fn swing_time(&self) -> f32 {
        self.swing_time
    }

    /// Current transfer duration in seconds.
    #[must_use]
    pub fn transfer_time(&self) -> f32 {
        self.transfer_time
    }

    /// Refresh the swing duration for the footstep about to swing.
    pub fn update_swing_time(&mut self, footstep: Option<&Footstep>) {
        self.swing_time = footstep
            .and_then(|footstep| footstep.timing)
            .filter(|timing| timing.is_valid())
            .map_or(self.default_swing_time, |timing| timing.swing_time());
    }

    /// Refresh the transfer duration for the footstep about to swing.
    pub fn update_transfer_time(&mut self, footstep: Option<&Footstep>) {
        self.transfer_time = footstep
            .and_then(|footstep| footstep.timing)
            .filter(|timing| timing.is_valid())
            .map_or(self.default_transfer_time, |timing| timing.transfer_time());
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Isometry3;

    use super::TimingProvider;
    use crate::footstep::{Footstep, FootstepTiming, Side};

    #[test]
    fn defaults_apply_without_an_override() {
        let mut timing = TimingProvider::new(0.7, 0.25);
        timing.update_swing_time(None);
        timing.update_transfer_time(None);

        assert_eq!(timing.swing_time(), 0.7);
        assert_eq!(timing.transfer_time(), 0.25);
    }

    #[test]
    fn valid_override_replaces_the_defaults() {
        let mut timing = TimingProvider::new(0.7, 0.25);
        let mut footstep = Footstep::at_pose(Side::Left, Isometry3::identity());
        footstep.timing = Some(FootstepTiming::new(0.9, 0.3));

        timing.update_swing_time(Some(&footstep));
        timing.update_transfer_time(Some(&footstep));

        assert_eq!(timing.swing_time(), 0.9);
        assert_eq!(timing.transfer_time(), 0.3);
    }

    #[test]
    fn invalid_override_falls_back_to_the_defaults() {
        let mut timing = TimingProvider::new(0.7, 0.25);
        let mut footstep = Footstep::at_pose(Side::Left, Isometry3::identity());
        footstep.timing = Some(FootstepTiming::new(-0.5, 0.3));

        timing.update_swing_time(Some(&footstep));
        assert_eq!(timing.swing_time(), 0.7);
    }
}
