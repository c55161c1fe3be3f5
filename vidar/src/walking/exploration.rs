use serde::{Deserialize, Serialize};
use tracing::info;

use crate::footstep::{Footstep, Side};

/// Configuration for foothold exploration on unknown terrain.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FootExplorationConfig {
    /// Master switch; exploration is inert when false.
    pub enabled: bool,
    /// Time budget for probing a foothold before trusting it, in seconds.
    pub exploration_time: f32,
}

impl Default for FootExplorationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exploration_time: 1.5,
        }
    }
}

/// Foothold exploration: when a footstep lands on unknown terrain the swing
/// foot probes the foothold before the controller commits its weight to it.
///
/// While exploring, the usual single-support done conditions are overridden
/// by [`FootExploration::is_done`].
#[derive(Debug, Clone)]
pub struct FootExploration {
    config: FootExplorationConfig,
    controlling_swing_foot: bool,
    done: bool,
    started_at: f32,
    swing_side: Option<Side>,
}

impl FootExploration {
    #[must_use]
    pub fn new(config: FootExplorationConfig) -> Self {
        Self {
            config,
            controlling_swing_foot: false,
            done: false,
            started_at: 0.0,
            swing_side: None,
        }
    }

    /// Arm exploration for the upcoming swing.
    ///
    /// Only footsteps without a predicted contact polygon need probing: the
    /// planner marking contact points means the terrain is known.
    pub fn initialize(&mut self, footstep: Option<&Footstep>, swing_side: Side, now: f32) {
        if !self.config.enabled {
            return;
        }

        let needs_exploration = footstep
            .map(|footstep| footstep.predicted_contact_points.is_none())
            .unwrap_or(false);

        self.controlling_swing_foot = needs_exploration;
        self.done = false;
        self.started_at = now;
        self.swing_side = needs_exploration.then_some(swing_side);

        if needs_exploration {
            info!(?swing_side, "exploring the upcoming foothold");
        }
    }

    /// Advance the probing state; call once per tick while in control.
    pub fn update(&mut self, now: f32) {
        if self.controlling_swing_foot
            && !self.done
            && now - self.started_at > self.config.exploration_time
        {
            info!(side = ?self.swing_side, "foothold accepted");
            self.done = true;
        }
    }

    #[must_use]
    pub fn is_controlling_swing_foot(&self) -> bool {
        self.controlling_swing_foot
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_swing_is_finished(&mut self, finished: bool) {
        if finished {
            self.controlling_swing_foot = false;
        }
    }

    pub fn reset(&mut self) {
        self.controlling_swing_foot = false;
        self.done = false;
        self.swing_side = None;
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Isometry3;

    use super::{FootExploration, FootExplorationConfig};
    use crate::footstep::{Footstep, Side};

    fn exploration(enabled: bool) -> FootExploration {
        FootExploration::new(FootExplorationConfig {
            enabled,
            exploration_time: 1.0,
        })
    }

    #[test]
    fn disabled_exploration_never_takes_control() {
        let mut exploration = exploration(false);
        let footstep = Footstep::at_pose(Side::Left, Isometry3::identity());

        exploration.initialize(Some(&footstep), Side::Left, 0.0);
        assert!(!exploration.is_controlling_swing_foot());
    }

    #[test]
    fn known_contact_points_skip_exploration() {
        let mut exploration = exploration(true);
        let mut footstep = Footstep::at_pose(Side::Left, Isometry3::identity());
        footstep.predicted_contact_points = Some(vec![nalgebra::Point2::new(0.0, 0.0)]);

        exploration.initialize(Some(&footstep), Side::Left, 0.0);
        assert!(!exploration.is_controlling_swing_foot());
    }

    #[test]
    fn probing_finishes_after_the_time_budget() {
        let mut exploration = exploration(true);
        let footstep = Footstep::at_pose(Side::Left, Isometry3::identity());

        exploration.initialize(Some(&footstep), Side::Left, 10.0);
        assert!(exploration.is_controlling_swing_foot());
        assert!(!exploration.is_done());

        exploration.update(10.5);
        assert!(!exploration.is_done());

        exploration.update(11.2);
        assert!(exploration.is_done());

        exploration.set_swing_is_finished(true);
        assert!(!exploration.is_controlling_swing_foot());
    }
}
