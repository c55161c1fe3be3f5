//! Per-tick estimates derived from the raw sensor resources: natural
//! frequency, capture point, centers of pressure and foot switch states.
//!
//! Upstream producers (state estimator, load cells) write the raw resources
//! before the control schedule runs; everything here is synchronous and
//! memory-resident by the time the walking tick starts.

use bevy::prelude::*;
use nalgebra::{Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    footstep::{Side, SideDependent},
    prelude::ControlSet,
};

pub const GRAVITY: f32 = 9.81;

/// Configuration for the sensor-derived estimates.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct EstimationConfig {
    /// Normalized vertical load above which a foot counts as loaded.
    pub contact_load_threshold: f32,
    /// Normalized load on the toe or heel cells above which that edge counts
    /// as touched down.
    pub edge_load_threshold: f32,
    /// Lower bound on the CoM height used for ω₀, in meters.
    ///
    /// Guards the ω₀ = √(g/z) computation against a degenerate height estimate
    /// during deep crouches or estimator glitches.
    pub minimum_com_height: f32,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            contact_load_threshold: 0.15,
            edge_load_threshold: 0.25,
            minimum_com_height: 0.2,
        }
    }
}

/// Center of mass position and velocity in the world frame, written by the
/// upstream state estimator.
#[derive(Resource, Debug, Clone, Copy)]
pub struct CenterOfMassState {
    pub position: Point3<f32>,
    pub velocity: Vector3<f32>,
}

impl Default for CenterOfMassState {
    fn default() -> Self {
        Self {
            position: Point3::new(0.0, 0.0, 0.8),
            velocity: Vector3::zeros(),
        }
    }
}

/// Pelvis position and velocity in the world frame.
#[derive(Resource, Debug, Clone, Copy)]
pub struct PelvisState {
    pub position: Point3<f32>,
    pub velocity: Vector3<f32>,
}

impl Default for PelvisState {
    fn default() -> Self {
        Self {
            position: Point3::new(0.0, 0.0, 0.9),
            velocity: Vector3::zeros(),
        }
    }
}

/// Raw per-foot load cell readings, normalized to body weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct FootLoad {
    pub total: f32,
    pub toe: f32,
    pub heel: f32,
    /// Measured center of pressure in the sole frame, when loaded.
    pub cop: Option<Point2<f32>>,
}

/// Raw load readings for both feet, written by the upstream sensor layer.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct FootLoads(pub SideDependent<FootLoad>);

/// Which touch-down events a fitted foot switch can report.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FootSwitchKind {
    /// Full wrench sensing: whole-foot, toe and heel contact.
    #[default]
    WrenchBased,
    /// Binary contact only; toe and heel touch-down are unavailable.
    ContactOnly,
}

/// Debounced contact state of one foot switch.
#[derive(Debug, Default, Clone, Copy)]
pub struct FootSwitch {
    pub kind: FootSwitchKind,
    foot_contact: bool,
    toe_contact: bool,
    heel_contact: bool,
}

impl FootSwitch {
    #[must_use]
    pub fn new(kind: FootSwitchKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_foot_hit_ground(&self) -> bool {
        self.foot_contact
    }

    #[must_use]
    pub fn has_toe_hit_ground(&self) -> bool {
        self.toe_contact
    }

    #[must_use]
    pub fn has_heel_hit_ground(&self) -> bool {
        self.heel_contact
    }

    /// Forget any latched contact, e.g. when the foot starts swinging.
    pub fn reset(&mut self) {
        self.foot_contact = false;
        self.toe_contact = false;
        self.heel_contact = false;
    }

    pub(crate) fn update(&mut self, load: &FootLoad, config: &EstimationConfig) {
        self.foot_contact = load.total > config.contact_load_threshold;
        if self.kind == FootSwitchKind::WrenchBased {
            self.toe_contact = load.toe > config.edge_load_threshold;
            self.heel_contact = load.heel > config.edge_load_threshold;
        }
    }
}

/// Foot switch states for both feet.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct FootSwitches(pub SideDependent<FootSwitch>);

/// Measured centers of pressure, in the world frame.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct CenterOfPressure {
    /// Per-foot CoP; `None` while the foot is unloaded.
    pub feet: SideDependent<Option<Point2<f32>>>,
    /// Load-weighted combination of both feet.
    pub combined: Option<Point2<f32>>,
}

/// Current leg extension per side, in meters, written by the upstream
/// kinematics.
#[derive(Resource, Debug, Clone, Copy)]
pub struct LegExtensions(pub SideDependent<f32>);

impl Default for LegExtensions {
    fn default() -> Self {
        Self(SideDependent::new(0.7, 0.7))
    }
}

/// Natural frequency of the linear inverted pendulum, ω₀ = √(g/z̄).
#[derive(Resource, Debug, Clone, Copy)]
pub struct Omega0(pub f32);

impl Default for Omega0 {
    fn default() -> Self {
        Self((GRAVITY / 0.8).sqrt())
    }
}

/// Measured capture point in the world frame.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct CapturePoint {
    pub position: Point2<f32>,
}

/// Plugin that derives the walking controller's estimates each cycle.
pub struct EstimationPlugin;

impl Plugin for EstimationPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<CenterOfMassState>()
            .init_resource::<PelvisState>()
            .init_resource::<FootLoads>()
            .init_resource::<FootSwitches>()
            .init_resource::<LegExtensions>()
            .init_resource::<Omega0>()
            .init_resource::<CapturePoint>()
            .init_resource::<CenterOfPressure>();

        app.add_systems(
            Update,
            (
                update_omega0,
                update_capture_point,
                update_foot_switches,
                update_center_of_pressure,
            )
                .chain()
                .in_set(ControlSet::Estimate),
        );
    }
}

fn update_omega0(
    mut omega0: ResMut<Omega0>,
    com: Res<CenterOfMassState>,
    config: Res<crate::walking::WalkingConfig>,
) {
    let height = com.position.z.max(config.estimation.minimum_com_height);
    omega0.0 = (GRAVITY / height).sqrt();
}

fn update_capture_point(
    mut capture_point: ResMut<CapturePoint>,
    com: Res<CenterOfMassState>,
    omega0: Res<Omega0>,
) {
    let com_xy = Point2::new(com.position.x, com.position.y);
    let velocity_xy = Vector2::new(com.velocity.x, com.velocity.y);
    let estimate = com_xy + velocity_xy / omega0.0;

    if estimate.coords.iter().any(|value| !value.is_finite()) {
        warn!("capture point estimate is not finite, holding previous value");
        return;
    }

    capture_point.position = estimate;
}

pub(crate) fn update_foot_switches(
    mut switches: ResMut<FootSwitches>,
    loads: Res<FootLoads>,
    config: Res<crate::walking::WalkingConfig>,
) {
    for side in [Side::Left, Side::Right] {
        switches
            .0
            .get_mut(side)
            .update(loads.0.get(side), &config.estimation);
    }
}

fn update_center_of_pressure(
    mut cop: ResMut<CenterOfPressure>,
    loads: Res<FootLoads>,
    foot_poses: Res<crate::contact::FootPoses>,
) {
    let mut weighted = Vector2::zeros();
    let mut total_load = 0.0;

    for side in [Side::Left, Side::Right] {
        let load = loads.0.get(side);
        let world = load.cop.map(|point| {
            let world = foot_poses
                .0
                .get(side)
                .transform_point(&Point3::new(point.x, point.y, 0.0));
            Point2::new(world.x, world.y)
        });

        *cop.feet.get_mut(side) = world;
        if let Some(point) = world {
            weighted += point.coords * load.total;
            total_load += load.total;
        }
    }

    // an airborne robot has no meaningful center of pressure
    cop.combined = (total_load > f32::EPSILON).then(|| Point2::from(weighted / total_load));
}

#[cfg(test)]
mod tests {
    use nalgebra::Point2;

    use super::{EstimationConfig, FootLoad, FootSwitch, FootSwitchKind, GRAVITY};

    #[test]
    fn omega0_matches_pendulum_height() {
        let omega0 = (GRAVITY / 0.8_f32).sqrt();
        assert!((omega0 - 3.502).abs() < 1e-3);
    }

    #[test]
    fn wrench_based_switch_reports_edges() {
        let config = EstimationConfig::default();
        let mut switch = FootSwitch::new(FootSwitchKind::WrenchBased);

        switch.update(
            &FootLoad {
                total: 0.6,
                toe: 0.5,
                heel: 0.05,
                cop: Some(Point2::new(0.04, 0.0)),
            },
            &config,
        );

        assert!(switch.has_foot_hit_ground());
        assert!(switch.has_toe_hit_ground());
        assert!(!switch.has_heel_hit_ground());
    }

    #[test]
    fn contact_only_switch_never_reports_edges() {
        let config = EstimationConfig::default();
        let mut switch = FootSwitch::new(FootSwitchKind::ContactOnly);

        switch.update(
            &FootLoad {
                total: 0.6,
                toe: 0.6,
                heel: 0.6,
                cop: None,
            },
            &config,
        );

        assert!(switch.has_foot_hit_ground());
        assert!(!switch.has_toe_hit_ground());
        assert!(!switch.has_heel_hit_ground());
    }

    #[test]
    fn reset_clears_latched_contact() {
        let config = EstimationConfig::default();
        let mut switch = FootSwitch::new(FootSwitchKind::WrenchBased);
        switch.update(
            &FootLoad {
                total: 0.6,
                toe: 0.6,
                heel: 0.6,
                cop: None,
            },
            &config,
        );

        switch.reset();
        assert!(!switch.has_foot_hit_ground());
    }
}
