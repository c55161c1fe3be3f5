//! The walking controller: state machine, ICP feedback, toe-off and the
//! resources/events wiring it into the control schedule.

mod conditions;
mod context;
mod exploration;
mod icp_feedback;
mod state_machine;
mod timing;
mod toe_off;
mod transfer_data;

pub use context::WalkingContext;
pub use exploration::{FootExploration, FootExplorationConfig};
pub use icp_feedback::{IcpFeedbackConfig, IcpProportionalController};
pub use state_machine::{TickInputs, TickOutputs, WalkingMachine, WalkingState};
pub use timing::TimingProvider;
pub use toe_off::{ToeOffConfig, ToeOffManager};
pub use transfer_data::TransferToAndNextFootsteps;

use bevy::prelude::*;
use nalgebra::{Isometry3, Point2, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    contact::{ContactChangeRequest, ContactStates, FootGeometry, FootPoses, SupportPolygons},
    estimation::{
        CapturePoint, CenterOfMassState, EstimationConfig, FootSwitch, FootSwitchKind,
        FootSwitches, LegExtensions, Omega0, PelvisState,
    },
    footstep::{Footstep, FootstepProvider, Side, SideDependent},
    height::{HeightConfig, KneeAction},
    icp::IcpPlannerConfig,
    prelude::{Config, ConfigExt, ControlSet, ControlTick},
    push_recovery::{PushRecoveryConfig, RecoveryPlanMailbox},
};

/// Which part of the swing foot is expected to touch down first.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingMode {
    #[default]
    Flat,
    Toes,
    Heel,
}

/// A wiring bug caught before motion starts.
#[derive(Debug, Error, miette::Diagnostic)]
pub enum WiringError {
    #[error(
        "landing mode {mode:?} requires wrench-based foot switches, but {kind:?} switches are fitted"
    )]
    LandingModeSwitchMismatch {
        mode: LandingMode,
        kind: FootSwitchKind,
    },
    #[error("minimum swing fraction must lie in [0, 1], got {0}")]
    InvalidMinimumSwingFraction(f32),
    #[error("default swing and transfer times must be positive and finite")]
    InvalidDefaultTiming,
}

/// Configuration for the walking controller.
#[derive(Resource, Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct WalkingConfig {
    /// Default swing duration, in seconds; footsteps may override it.
    pub default_swing_time: f32,

    /// Default transfer duration, in seconds; footsteps may override it.
    pub default_transfer_time: f32,

    /// ICP tracking error below which a transfer may hand over to single
    /// support, in meters.
    pub max_icp_error_before_single_support: f32,

    /// Fraction of the swing time that must always elapse before a
    /// touch-down is accepted.
    pub minimum_swing_fraction: f32,

    /// Time to stay in single support after the ICP plan finished without a
    /// registered touch-down, in seconds.
    pub dwell_in_single_support_duration: f32,

    /// Enable the dwell timeout as a single-support exit.
    pub do_transition_when_time_is_up: bool,

    /// Trajectory time used when settling into a stand, in seconds.
    pub stop_in_double_support_trajectory_time: f32,

    /// Extra time granted to the ICP plan on top of the swing duration, in
    /// seconds.
    pub additional_swing_time_for_icp: f32,

    /// Reuse the final desired ICP of the previous single support during the
    /// next transfer instead of re-planning it.
    pub remember_final_icp_from_single_support: bool,

    /// Expected touch-down mode of the swing foot.
    pub landing_mode: LandingMode,

    /// Kind of foot switch fitted to this robot.
    pub foot_switch_kind: FootSwitchKind,

    /// How far the desired ICP is pushed towards the upcoming foothold over
    /// the course of the swing, in meters.
    pub move_icp_away_during_swing_distance: f32,

    /// Total push of the desired ICP towards the upcoming foothold by the
    /// end of the swing, in meters.
    pub move_icp_away_at_end_of_swing_distance: f32,

    /// Swing time remaining at which the end-of-swing ICP shift begins, in
    /// seconds.
    pub single_support_time_left_before_shift: f32,

    /// Reset the loaded leg's joint integrators after its swing.
    pub reset_integrators_after_swing: bool,

    /// Sensor estimation parameters.
    pub estimation: EstimationConfig,

    /// Sole outline used for default contact polygons.
    pub foot_geometry: FootGeometry,

    /// ICP trajectory planner parameters.
    pub icp_planner: IcpPlannerConfig,

    /// Capture point feedback gains.
    pub icp_feedback: IcpFeedbackConfig,

    /// Push recovery parameters.
    pub push_recovery: PushRecoveryConfig,

    /// Toe-off parameters.
    pub toe_off: ToeOffConfig,

    /// CoM/pelvis height pipeline parameters.
    pub height: HeightConfig,

    /// Foothold exploration parameters.
    pub exploration: FootExplorationConfig,
}

impl Default for WalkingConfig {
    fn default() -> Self {
        Self {
            default_swing_time: 0.7,
            default_transfer_time: 0.25,
            max_icp_error_before_single_support: 0.035,
            minimum_swing_fraction: 0.5,
            dwell_in_single_support_duration: 0.2,
            do_transition_when_time_is_up: false,
            stop_in_double_support_trajectory_time: 0.5,
            additional_swing_time_for_icp: 0.1,
            remember_final_icp_from_single_support: false,
            landing_mode: LandingMode::Flat,
            foot_switch_kind: FootSwitchKind::WrenchBased,
            move_icp_away_during_swing_distance: 0.012,
            move_icp_away_at_end_of_swing_distance: 0.04,
            single_support_time_left_before_shift: 0.26,
            reset_integrators_after_swing: true,
            estimation: EstimationConfig::default(),
            foot_geometry: FootGeometry::default(),
            icp_planner: IcpPlannerConfig::default(),
            icp_feedback: IcpFeedbackConfig::default(),
            push_recovery: PushRecoveryConfig::default(),
            toe_off: ToeOffConfig::default(),
            height: HeightConfig::default(),
            exploration: FootExplorationConfig::default(),
        }
    }
}

impl Config for WalkingConfig {
    const PATH: &'static str = "walking.toml";
}

impl WalkingConfig {
    /// Check the configuration for wiring bugs.
    pub fn validate(&self) -> Result<(), WiringError> {
        if self.landing_mode != LandingMode::Flat
            && self.foot_switch_kind != FootSwitchKind::WrenchBased
        {
            return Err(WiringError::LandingModeSwitchMismatch {
                mode: self.landing_mode,
                kind: self.foot_switch_kind,
            });
        }

        if !(0.0..=1.0).contains(&self.minimum_swing_fraction) {
            return Err(WiringError::InvalidMinimumSwingFraction(
                self.minimum_swing_fraction,
            ));
        }

        let valid_time =
            |time: f32| time.is_finite() && time > 0.0;
        if !valid_time(self.default_swing_time) || !valid_time(self.default_transfer_time) {
            return Err(WiringError::InvalidDefaultTiming);
        }

        Ok(())
    }
}

/// A requested pose for a free foot (flamingo stance).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FootPoseRequest {
    pub pose: Isometry3<f32>,
    /// Time to reach the pose, in seconds.
    pub trajectory_time: f32,
}

/// Pending foot pose requests from the operator or behavior layer.
#[derive(Resource, Debug, Default, Clone)]
pub struct FootPoseRequests(SideDependent<Option<FootPoseRequest>>);

impl FootPoseRequests {
    pub fn request(&mut self, side: Side, request: FootPoseRequest) {
        *self.0.get_mut(side) = Some(request);
    }

    #[must_use]
    pub fn has_new(&self, side: Side) -> bool {
        self.0.get(side).is_some()
    }

    #[must_use]
    pub fn has_any_new(&self) -> bool {
        self.has_new(Side::Left) || self.has_new(Side::Right)
    }

    pub fn take(&mut self, side: Side) -> Option<FootPoseRequest> {
        self.0.get_mut(side).take()
    }
}

/// External walking command; checked once per tick.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct WalkingCommand {
    /// Settle into double support at the next opportunity.
    pub stop_walking: bool,
}

/// The walking state machine as a resource.
#[derive(Resource, Debug, Deref, DerefMut)]
pub struct WalkingController(pub WalkingMachine);

/// Producer handle for the footstep queue, clonable by external providers.
#[derive(Resource, Debug, Clone)]
pub struct FootstepProviderHandle(pub FootstepProvider);

/// Handle for the anytime push-recovery planner.
#[derive(Resource, Debug, Clone)]
pub struct RecoveryMailboxHandle(pub RecoveryPlanMailbox);

/// Outputs of the last control tick, consumed by the output systems.
#[derive(Resource, Debug, Default)]
pub struct WalkingOutputs(pub TickOutputs);

/// Desired capture point trajectory sample for the momentum controller.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct DesiredIcp {
    pub position: Point2<f32>,
    pub velocity: Vector2<f32>,
}

/// Desired centroidal moment pivot for the momentum controller.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct DesiredCmp {
    pub cmp: Point2<f32>,
    pub ecmp: Point2<f32>,
}

/// Commanded vertical CoM/pelvis acceleration.
#[derive(Resource, Debug, Default, Clone)]
pub struct DesiredComHeightAcceleration {
    pub acceleration: f32,
    pub knee_actions: Vec<(Side, KneeAction)>,
}

/// Joint integrator requests for the downstream joint controller.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct IntegratorRequests {
    pub integrate_swing_ankles: Option<Side>,
    pub reset_leg_integrators: Option<Side>,
}

/// A footstep finished executing.
#[derive(Event, Debug, Clone)]
pub struct FootstepCompletedEvent {
    pub footstep: Footstep,
    pub actual_pose: Option<Isometry3<f32>>,
}

/// The whole walking sequence finished; the robot is standing.
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct WalkingCompleteEvent;

/// The queue is running dry; the external planner should send more steps.
#[derive(Event, Debug, Clone, Copy, Default)]
pub struct MoreFootstepsRequestedEvent;

/// A free foot should move to a requested pose.
#[derive(Event, Debug, Clone)]
pub struct FootPoseMotionEvent {
    pub side: Side,
    pub request: FootPoseRequest,
}

/// Emit per-tick debug logs of the controller outputs.
#[derive(Resource, Debug, Clone, Copy)]
struct DebugLogging(bool);

/// Plugin wiring the walking controller into the control schedule.
#[derive(Default)]
pub struct WalkingControlPlugin {
    /// Log the controller outputs every tick.
    pub debug_logging: bool,
}

impl Plugin for WalkingControlPlugin {
    fn build(&self, app: &mut App) {
        app.init_config::<WalkingConfig>();

        app.insert_resource(DebugLogging(self.debug_logging));
        app.init_resource::<FootPoseRequests>()
            .init_resource::<WalkingCommand>()
            .init_resource::<WalkingOutputs>()
            .init_resource::<DesiredIcp>()
            .init_resource::<DesiredCmp>()
            .init_resource::<DesiredComHeightAcceleration>()
            .init_resource::<IntegratorRequests>();

        app.add_event::<FootstepCompletedEvent>()
            .add_event::<WalkingCompleteEvent>()
            .add_event::<MoreFootstepsRequestedEvent>()
            .add_event::<FootPoseMotionEvent>();

        app.add_systems(PostStartup, setup_walking_controller);
        app.add_systems(Update, run_walking_tick.in_set(ControlSet::Tick));
        app.add_systems(Update, publish_outputs.in_set(ControlSet::Output));
    }
}

fn setup_walking_controller(
    mut commands: Commands,
    config: Res<WalkingConfig>,
    tick: Res<ControlTick>,
    capture_point: Res<CapturePoint>,
) {
    // a wiring bug here must halt before any motion starts
    let mut machine = match WalkingMachine::new(config.clone(), tick.period) {
        Ok(machine) => machine,
        Err(error) => panic!("{:?}", miette::Report::new(error)),
    };
    machine.initialize(capture_point.position);

    commands.insert_resource(FootstepProviderHandle(machine.queue.provider()));
    commands.insert_resource(RecoveryMailboxHandle(machine.push_recovery.mailbox()));

    commands.insert_resource(ContactStates::new(config.foot_geometry));
    let switch = FootSwitch::new(config.foot_switch_kind);
    commands.insert_resource(FootSwitches(SideDependent::new(switch, switch)));

    commands.insert_resource(WalkingController(machine));
}

#[allow(clippy::too_many_arguments)]
fn run_walking_tick(
    mut controller: ResMut<WalkingController>,
    tick: Res<ControlTick>,
    capture_point: Res<CapturePoint>,
    omega0: Res<Omega0>,
    com: Res<CenterOfMassState>,
    pelvis: Res<PelvisState>,
    foot_poses: Res<FootPoses>,
    leg_extensions: Res<LegExtensions>,
    command: Res<WalkingCommand>,
    mut switches: ResMut<FootSwitches>,
    mut foot_pose_requests: ResMut<FootPoseRequests>,
    mut contacts: ResMut<ContactStates>,
    mut support: ResMut<SupportPolygons>,
    mut outputs: ResMut<WalkingOutputs>,
) {
    let inputs = TickInputs {
        now: tick.now,
        capture_point: capture_point.position,
        omega0: omega0.0,
        com: *com,
        pelvis: *pelvis,
        foot_poses: *foot_poses,
        leg_lengths: leg_extensions.0,
        stop_requested: command.stop_walking,
    };

    let mut tick_outputs = TickOutputs::default();
    controller.tick(
        &inputs,
        &mut switches,
        &mut foot_pose_requests,
        &mut contacts,
        &mut support,
        &mut tick_outputs,
    );

    outputs.0 = tick_outputs;
}

#[allow(clippy::too_many_arguments)]
fn publish_outputs(
    mut outputs: ResMut<WalkingOutputs>,
    mut desired_icp: ResMut<DesiredIcp>,
    mut desired_cmp: ResMut<DesiredCmp>,
    mut desired_height: ResMut<DesiredComHeightAcceleration>,
    mut integrators: ResMut<IntegratorRequests>,
    mut contact_changes: EventWriter<ContactChangeRequest>,
    mut completed: EventWriter<FootstepCompletedEvent>,
    mut walking_complete: EventWriter<WalkingCompleteEvent>,
    mut more_footsteps: EventWriter<MoreFootstepsRequestedEvent>,
    mut foot_pose_motions: EventWriter<FootPoseMotionEvent>,
    debug_logging: Res<DebugLogging>,
) {
    let outputs = std::mem::take(&mut outputs.0);

    desired_icp.position = outputs.desired_icp;
    desired_icp.velocity = outputs.desired_icp_velocity;
    desired_cmp.cmp = outputs.desired_cmp;
    desired_cmp.ecmp = outputs.desired_ecmp;
    desired_height.acceleration = outputs.height_acceleration;
    desired_height.knee_actions = outputs.knee_actions;
    integrators.integrate_swing_ankles = outputs.integrate_swing_ankles;
    integrators.reset_leg_integrators = outputs.reset_leg_integrators;

    for (side, state) in outputs.contact_changes {
        contact_changes.send(ContactChangeRequest { side, state });
    }

    for (footstep, actual_pose) in outputs.completed_footsteps {
        completed.send(FootstepCompletedEvent {
            footstep,
            actual_pose,
        });
    }

    if outputs.walking_complete {
        walking_complete.send(WalkingCompleteEvent);
    }

    if outputs.request_more_footsteps {
        more_footsteps.send(MoreFootstepsRequestedEvent);
    }

    for (side, request) in outputs.foot_pose_motions {
        foot_pose_motions.send(FootPoseMotionEvent { side, request });
    }

    if debug_logging.0 {
        debug!(
            icp = ?desired_icp.position,
            cmp = ?desired_cmp.cmp,
            height_acceleration = desired_height.acceleration,
            "walking outputs"
        );
    }
}
