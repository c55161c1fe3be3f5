//! The walking state machine: an explicit state enum plus transition and
//! action functions over a shared [`WalkingContext`].

use nalgebra::{Point2, Vector2};
use tracing::{debug, info};

use super::{
    FootPoseRequest, FootPoseRequests, WalkingConfig, WiringError,
    conditions,
    context::WalkingContext,
    exploration::FootExploration,
    icp_feedback::IcpProportionalController,
    timing::TimingProvider,
    toe_off::ToeOffManager,
    transfer_data::TransferToAndNextFootsteps,
};
use crate::{
    contact::{
        ContactState, ContactStates, FootPoses, SupportPolygons, compute_support_polygons,
        mid_feet_frame,
    },
    estimation::{CenterOfMassState, FootSwitches, PelvisState},
    footstep::{Footstep, FootstepQueue, Side, SideDependent},
    geometry::ConvexPolygon2,
    height::{HeightInputs, HeightPipeline, KneeAction},
    icp::IcpPlanner,
    push_recovery::PushRecoveryModule,
};

/// Weight of the upcoming stance centroid in the double-stance final ICP.
const TRAILING_TO_LEADING_FOOT_FACTOR: f32 = 0.5;

/// Duration of the very first weight shift out of a stand, in seconds.
// TODO: tune; placeholder value
const DOUBLE_SUPPORT_INITIAL_TRANSFER_DURATION: f32 = 0.4;

/// Queue length above which the provider is treated as a per-tick stream and
/// the recovery stand collapse must leave it alone.
// TODO: revisit; placeholder threshold
const FOOTSTEP_PROVIDER_STREAM_GUARD: usize = 1000;

/// Remaining steps at or below which plans settle instead of keeping
/// momentum for further steps.
const STOP_IF_REACHED_END_WINDOW: usize = 3;

/// Planner slack below which the footstep lookahead may advance, in seconds.
const FOOTSTEP_GRAB_SLACK: f32 = 0.02;

/// Lateral offset of the stand step placed beside a recovery step, in meters.
const RECOVERY_STAND_OFFSET: f32 = 0.3;

/// Stance-to-swing distances below this are degenerate; the end-of-swing ICP
/// shift is skipped entirely.
const MINIMUM_STANCE_TO_SWING_DISTANCE: f32 = 0.001;

/// Fraction of the desired ICP's distance to the support centroid removed by
/// the stand projection.
const STAND_CENTROID_PULL_FRACTION: f32 = 0.10;

/// The active walking state. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkingState {
    DoubleSupport,
    Transfer(Side),
    SingleSupport(Side),
}

impl WalkingState {
    /// The side weight is being transferred to, for the double support family.
    #[must_use]
    pub fn transfer_to_side(self) -> Option<Side> {
        match self {
            WalkingState::Transfer(side) => Some(side),
            _ => None,
        }
    }
}

/// Action attached to a transition, run between the exit and entry actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionAction {
    None,
    ResetIcpTrajectory,
}

/// Sensor inputs for one tick, snapshotted before the state machine runs.
#[derive(Debug, Clone)]
pub struct TickInputs {
    pub now: f32,
    pub capture_point: Point2<f32>,
    pub omega0: f32,
    pub com: CenterOfMassState,
    pub pelvis: PelvisState,
    pub foot_poses: FootPoses,
    /// Current leg extension per side, in meters.
    pub leg_lengths: SideDependent<f32>,
    /// Abort signal: settle into double support at the next opportunity.
    pub stop_requested: bool,
}

/// Everything one tick hands to the downstream whole-body controller.
#[derive(Debug, Clone, Default)]
pub struct TickOutputs {
    pub desired_icp: Point2<f32>,
    pub desired_icp_velocity: Vector2<f32>,
    pub desired_ecmp: Point2<f32>,
    pub desired_cmp: Point2<f32>,
    pub height_acceleration: f32,
    pub knee_actions: Vec<(Side, KneeAction)>,
    pub contact_changes: Vec<(Side, ContactState)>,
    pub completed_footsteps: Vec<(Footstep, Option<nalgebra::Isometry3<f32>>)>,
    pub walking_complete: bool,
    pub request_more_footsteps: bool,
    pub foot_pose_motions: Vec<(Side, FootPoseRequest)>,
    /// Swing leg whose ankle accelerations should be integrated this tick.
    pub integrate_swing_ankles: Option<Side>,
    /// Leg whose joint integrators should be reset after its swing.
    pub reset_leg_integrators: Option<Side>,
}

/// The top-level walking controller state machine.
#[derive(Debug)]
pub struct WalkingMachine {
    config: WalkingConfig,
    pub state: WalkingState,
    state_entry_time: f32,
    pub ctx: WalkingContext,
    pub queue: FootstepQueue,
    pub planner: IcpPlanner,
    pub push_recovery: PushRecoveryModule,
    pub toe_off: ToeOffManager,
    pub height: HeightPipeline,
    pub exploration: FootExploration,
    icp_feedback: IcpProportionalController,
    pub timing: TimingProvider,
}

impl WalkingMachine {
    /// Build and validate the machine.
    ///
    /// Wiring mismatches (e.g. a toe landing mode on a robot without toe
    /// switches) are unrecoverable and reported before any motion starts.
    pub fn new(config: WalkingConfig, control_dt: f32) -> Result<Self, WiringError> {
        config.validate()?;

        Ok(Self {
            state: WalkingState::DoubleSupport,
            state_entry_time: 0.0,
            ctx: WalkingContext::default(),
            queue: FootstepQueue::new(),
            planner: IcpPlanner::new(config.icp_planner.clone()),
            push_recovery: PushRecoveryModule::new(config.push_recovery.clone()),
            toe_off: ToeOffManager::new(config.toe_off.clone()),
            height: HeightPipeline::new(config.height.clone(), control_dt),
            exploration: FootExploration::new(config.exploration.clone()),
            icp_feedback: IcpProportionalController::new(config.icp_feedback.clone()),
            timing: TimingProvider::new(config.default_swing_time, config.default_transfer_time),
            config,
        })
    }

    /// Seed the desired ICP from the first capture point measurement.
    pub fn initialize(&mut self, capture_point: Point2<f32>) {
        self.ctx.desired_icp = capture_point;
    }

    fn time_in_state(&self, now: f32) -> f32 {
        now - self.state_entry_time
    }

    /// Run one control period.
    ///
    /// Never blocks: every input is memory-resident by the time this runs.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        inputs: &TickInputs,
        switches: &mut FootSwitches,
        foot_pose_requests: &mut FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
    ) {
        let now = inputs.now;

        if inputs.stop_requested {
            self.queue.clear_pending();
        }

        self.exploration.update(now);

        self.push_recovery.update_inputs(
            inputs.capture_point,
            self.ctx.desired_icp,
            &support.combined,
            mid_feet_frame(&inputs.foot_poses),
            inputs.omega0,
        );

        if let Some((next_state, action)) =
            self.check_transitions(inputs, switches, foot_pose_requests, contacts, now)
        {
            let old_state = self.state;
            self.exit_state(old_state, inputs, contacts, support, outputs, now);

            if action == TransitionAction::ResetIcpTrajectory {
                self.planner.reset(now);
            }

            info!(?old_state, ?next_state, "walking state transition");
            self.state = next_state;
            self.state_entry_time = now;
            self.enter_state(next_state, inputs, switches, foot_pose_requests, contacts, support, outputs, now);
        }

        match self.state {
            WalkingState::DoubleSupport => {
                self.do_double_support_action(
                    None,
                    inputs,
                    foot_pose_requests,
                    contacts,
                    support,
                    outputs,
                    now,
                );
            }
            WalkingState::Transfer(side) => {
                self.do_double_support_action(
                    Some(side),
                    inputs,
                    foot_pose_requests,
                    contacts,
                    support,
                    outputs,
                    now,
                );
            }
            WalkingState::SingleSupport(side) => {
                self.do_single_support_action(
                    side,
                    inputs,
                    foot_pose_requests,
                    contacts,
                    support,
                    outputs,
                    now,
                );
            }
        }

        self.compute_momentum_command(inputs, contacts, support, outputs);
    }

    fn check_transitions(
        &mut self,
        inputs: &TickInputs,
        switches: &FootSwitches,
        foot_pose_requests: &FootPoseRequests,
        contacts: &ContactStates,
        now: f32,
    ) -> Option<(WalkingState, TransitionAction)> {
        let time_in_state = self.time_in_state(now);

        match self.state {
            WalkingState::DoubleSupport => {
                for side in [Side::Left, Side::Right] {
                    if conditions::start_walking(&self.ctx, &self.timing, side, time_in_state) {
                        return Some((WalkingState::Transfer(side), TransitionAction::None));
                    }

                    if self.push_recovery.check_falling_from_double_support(
                        side,
                        inputs.foot_poses.0.get(side.opposite()),
                    ) {
                        return Some((WalkingState::SingleSupport(side), TransitionAction::None));
                    }

                    if conditions::flamingo_stance(
                        &mut self.ctx,
                        foot_pose_requests,
                        &self.timing,
                        side,
                        time_in_state,
                    ) {
                        return Some((WalkingState::Transfer(side), TransitionAction::None));
                    }
                }

                None
            }
            WalkingState::Transfer(side) => {
                if conditions::stop_walking(
                    &self.config,
                    &mut self.ctx,
                    &self.planner,
                    &self.push_recovery,
                    &self.exploration,
                    &self.timing,
                    switches,
                    &self.queue,
                    foot_pose_requests,
                    side,
                    now,
                    time_in_state,
                ) {
                    return Some((
                        WalkingState::DoubleSupport,
                        TransitionAction::ResetIcpTrajectory,
                    ));
                }

                if conditions::done_with_transfer(
                    &self.config,
                    &self.ctx,
                    &self.planner,
                    contacts,
                    switches,
                    &self.exploration,
                    inputs.capture_point,
                    side,
                    now,
                ) {
                    return Some((WalkingState::SingleSupport(side), TransitionAction::None));
                }

                if self.push_recovery.check_falling_from_double_support(
                    side,
                    inputs.foot_poses.0.get(side.opposite()),
                ) {
                    return Some((WalkingState::SingleSupport(side), TransitionAction::None));
                }

                None
            }
            WalkingState::SingleSupport(support_side) => {
                // transfer onto the side that just landed...
                if conditions::single_support_to_transfer_to(
                    &self.config,
                    &mut self.ctx,
                    &self.planner,
                    &self.push_recovery,
                    &self.exploration,
                    &self.timing,
                    switches,
                    &self.queue,
                    support_side,
                    support_side,
                    now,
                    time_in_state,
                ) {
                    return Some((
                        WalkingState::Transfer(support_side.opposite()),
                        TransitionAction::None,
                    ));
                }

                // ...or back onto the same side when the same foot swings twice
                if conditions::single_support_to_transfer_to(
                    &self.config,
                    &mut self.ctx,
                    &self.planner,
                    &self.push_recovery,
                    &self.exploration,
                    &self.timing,
                    switches,
                    &self.queue,
                    support_side.opposite(),
                    support_side,
                    now,
                    time_in_state,
                ) {
                    return Some((
                        WalkingState::Transfer(support_side),
                        TransitionAction::None,
                    ));
                }

                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_state(
        &mut self,
        state: WalkingState,
        inputs: &TickInputs,
        switches: &mut FootSwitches,
        foot_pose_requests: &mut FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        match state {
            WalkingState::DoubleSupport => {
                self.enter_double_support(None, inputs, contacts, support, outputs, now);
            }
            WalkingState::Transfer(side) => {
                self.enter_double_support(Some(side), inputs, contacts, support, outputs, now);
            }
            WalkingState::SingleSupport(side) => {
                self.enter_single_support(side, inputs, switches, foot_pose_requests, contacts, support, outputs, now);
            }
        }
    }

    fn exit_state(
        &mut self,
        state: WalkingState,
        inputs: &TickInputs,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        match state {
            WalkingState::DoubleSupport | WalkingState::Transfer(_) => {
                self.exit_double_support(contacts, support, inputs);
            }
            WalkingState::SingleSupport(side) => {
                self.exit_single_support(side, inputs, outputs, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // double support / transfer
    // ------------------------------------------------------------------

    fn enter_double_support(
        &mut self,
        transfer_to: Option<Side>,
        inputs: &TickInputs,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        self.ctx.icp_stand_offset = Vector2::zeros();

        if self.ctx.support_leg.is_none() {
            // coming to rest, not stepping through
            outputs.walking_complete = true;
            self.height.invalidate_next_step();
        }

        self.toe_off.reset();
        self.ctx.trailing_leg = transfer_to;
        self.ctx.icp_trajectory_initialized = false;
        self.ctx.support_leg = None;

        // both feet carry weight again; the landing foot goes flat
        for side in [Side::Left, Side::Right] {
            contacts.set_in_contact(side, true);
        }
        if let Some(side) = transfer_to {
            let predicted = self
                .ctx
                .next_footstep
                .as_ref()
                .filter(|footstep| footstep.side == side)
                .and_then(|footstep| footstep.predicted_contact_points.clone());
            contacts.set_flat(side, predicted.as_deref());
            outputs.contact_changes.push((side, ContactState::Flat));
        }

        if let Some(side) = transfer_to {
            // a single-support plan still in flight is carried into the
            // transfer instead of being cut off
            if !self.planner.is_done(now) && !self.planner.is_performing_double_support() {
                let transfer_to_footstep = self.footstep_at_current_location(side, inputs, contacts);
                let data = self.create_transfer_data_for_single_support(
                    transfer_to_footstep,
                    side,
                    inputs,
                    contacts,
                );
                self.planner.re_initialize_single_support(&data, now);
            }
        }

        *support = compute_support_polygons(contacts, &inputs.foot_poses);

        if !self.height.has_been_initialized_with_next_step() {
            let side_for_data = transfer_to.unwrap_or(Side::Left);
            let data =
                self.create_transfer_data_for_double_support(side_for_data, true, inputs, contacts);
            let transfer_to_side = data.transfer_to_side;
            self.height.initialize(&data, transfer_to_side, None);
        }

        if self.push_recovery.is_enabled() {
            self.push_recovery.set_recover_from_double_support_footstep(None);
            self.push_recovery.set_recovering_from_double_support_state(false);
        }

        self.exploration.set_swing_is_finished(true);
    }

    fn exit_double_support(
        &mut self,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        inputs: &TickInputs,
    ) {
        self.ctx.icp_stand_offset = Vector2::zeros();
        self.ctx.footstep_list_updated = false;

        // any toe-off ends here
        for side in [Side::Left, Side::Right] {
            contacts.set_state(side, ContactState::Flat);
        }
        *support = compute_support_polygons(contacts, &inputs.foot_poses);
        self.toe_off.reset();

        self.ctx.desired_icp_velocity = Vector2::zeros();
        self.exploration.reset();
    }

    #[allow(clippy::too_many_arguments)]
    fn do_double_support_action(
        &mut self,
        transfer_to: Option<Side>,
        inputs: &TickInputs,
        foot_pose_requests: &FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        // the lookahead may only advance once the planner is wrapping up the
        // previous phase; grabbing earlier would re-target a plan in flight
        self.ctx.done_finishing_single_support_transfer =
            self.planner.is_performing_double_support();
        let estimated_time_remaining = self.planner.estimated_time_remaining(now);

        if self.ctx.done_finishing_single_support_transfer
            || estimated_time_remaining < FOOTSTEP_GRAB_SLACK
        {
            let grabbed = self.queue.check_for_footsteps(
                &mut self.ctx.ready_to_grab_next_footstep,
                &mut self.ctx.upcoming_support_leg,
            );
            self.ctx.footstep_list_updated = true;

            if grabbed && self.queue.is_provider_empty() {
                outputs.request_more_footsteps = true;
            }
        }

        self.initialize_icp_planner_if_necessary(
            transfer_to,
            inputs,
            foot_pose_requests,
            contacts,
            support,
            outputs,
            now,
        );

        let mut desired = self.planner.desired_icp_at(inputs.capture_point, now);

        if let Some(side) = transfer_to {
            let stance_location = foot_position2d(inputs, side);
            self.move_icp_to_inside_of_foot_at_end_of_swing(
                side.opposite(),
                stance_location,
                support,
                inputs,
                self.timing.swing_time(),
                0.0,
                &mut desired.position,
            );
        } else {
            if let Some(previous_support) = self.ctx.previous_support_side {
                let stance_location = foot_position2d(inputs, previous_support.opposite());
                self.move_icp_to_inside_of_foot_at_end_of_swing(
                    previous_support,
                    stance_location,
                    support,
                    inputs,
                    self.timing.swing_time(),
                    0.0,
                    &mut desired.position,
                );
            }

            // stand target: keep the desired ICP safely interior, with the
            // stand offset applied in the mid-feet frame
            let frame = mid_feet_frame(&inputs.foot_poses);
            let mut local = frame.inverse_transform_point(&desired.position);
            local += self.ctx.icp_stand_offset;
            desired.position = frame.transform_point(&local);

            desired.position = support.combined.orthogonal_projection(&desired.position);
            desired.position = support
                .combined
                .pull_towards_centroid(&desired.position, STAND_CENTROID_PULL_FRACTION);
        }

        self.ctx.desired_icp = desired.position;
        self.ctx.desired_icp_velocity = desired.velocity;
        self.ctx.desired_ecmp = desired.ecmp;

        self.initialize_ecmp_based_toe_off(transfer_to, inputs, contacts, support, outputs);
    }

    #[allow(clippy::too_many_arguments)]
    fn initialize_icp_planner_if_necessary(
        &mut self,
        transfer_to: Option<Side>,
        inputs: &TickInputs,
        foot_pose_requests: &FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        if self.ctx.icp_trajectory_initialized || !self.planner.is_done(now) {
            self.ctx.initializing_icp_trajectory = false;
            return;
        }

        self.ctx.initializing_icp_trajectory = true;

        let (final_desired_icp, trajectory_time) = self
            .compute_final_desired_icp_and_trajectory_time(
                transfer_to,
                inputs,
                foot_pose_requests,
                contacts,
                now,
            );

        if let Some(side) = transfer_to {
            // the only case left for determining the trailing contact state
            let trailing = side.opposite();
            let trailing_centroid = support
                .feet
                .get(trailing)
                .centroid_or(foot_position2d(inputs, trailing));

            if self.toe_off.request_toe_off_based_on_icp(
                trailing_centroid,
                self.ctx.desired_icp,
                final_desired_icp,
            ) {
                contacts.set_state(trailing, ContactState::ToeLine);
                outputs.contact_changes.push((trailing, ContactState::ToeLine));
                // downstream geometry needs the fresh polygon right away
                *support = compute_support_polygons(contacts, &inputs.foot_poses);
            }
        } else if !self.ctx.initialized_at_start {
            self.ctx.desired_icp = final_desired_icp;

            let mut data =
                self.create_transfer_data_for_double_support(Side::Left, true, inputs, contacts);
            data.double_support_duration = trajectory_time;
            self.planner.initialize_double_support(&data, now);

            let mut neutral = self.create_transfer_data_for_double_support(Side::Left, true, inputs, contacts);
            neutral.transfer_to_side = None;
            self.ctx.neutral_footsteps_data = Some(neutral);

            self.ctx.initialized_at_start = true;
        }

        *support = compute_support_polygons(contacts, &inputs.foot_poses);
        self.ctx.icp_trajectory_initialized = true;
    }

    /// The final desired ICP and trajectory time for this double support.
    ///
    /// The three-way precedence is load-bearing; do not unify the branches:
    /// (1) standing still uses the double-stance blend and invalidates any
    /// remembered final ICP, (2) a remembered single-support final ICP wins
    /// while valid, (3) otherwise the planner is initialized and its final
    /// ICP is remembered.
    fn compute_final_desired_icp_and_trajectory_time(
        &mut self,
        transfer_to: Option<Side>,
        inputs: &TickInputs,
        foot_pose_requests: &FootPoseRequests,
        contacts: &ContactStates,
        now: f32,
    ) -> (Point2<f32>, f32) {
        let Some(side) = transfer_to else {
            self.ctx.forget_final_icp();
            return (
                self.double_stance_final_desired_icp(inputs, contacts),
                self.config.stop_in_double_support_trajectory_time,
            );
        };

        if self.config.remember_final_icp_from_single_support
            && self.ctx.has_remembered_final_icp()
        {
            return (
                self.ctx.final_desired_icp_in_world,
                self.timing.transfer_time(),
            );
        }

        let mut data = self.create_transfer_data_for_double_support(side, false, inputs, contacts);
        if foot_pose_requests.has_any_new() {
            // flamingo stance: the "next footstep" is standing in place
            data.next_footstep = Some(self.footstep_at_current_location(side, inputs, contacts));
        }

        self.planner.initialize_double_support(&data, now);

        let final_desired_icp = self.planner.final_desired_icp();
        self.ctx.final_desired_icp_in_world = final_desired_icp;
        (final_desired_icp, self.timing.transfer_time())
    }

    /// Blend of the two foot centroids, weighted towards the upcoming support
    /// leg.
    fn double_stance_final_desired_icp(
        &self,
        inputs: &TickInputs,
        contacts: &ContactStates,
    ) -> Point2<f32> {
        let mut result = Vector2::zeros();
        for side in [Side::Left, Side::Right] {
            let polygon = contacts.sole_polygon(side);
            let centroid_local = polygon.centroid();
            let world = inputs.foot_poses.0.get(side).transform_point(
                &nalgebra::Point3::new(centroid_local.x, centroid_local.y, 0.0),
            );
            let centroid = Vector2::new(world.x, world.y);

            let factor = if side == self.ctx.upcoming_support_leg {
                TRAILING_TO_LEADING_FOOT_FACTOR
            } else {
                1.0 - TRAILING_TO_LEADING_FOOT_FACTOR
            };
            result += centroid * factor;
        }

        Point2::from(result)
    }

    fn initialize_ecmp_based_toe_off(
        &mut self,
        transfer_to: Option<Side>,
        inputs: &TickInputs,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
    ) {
        let Some(side) = transfer_to else {
            return;
        };

        if !self.toe_off.ecmp_trigger_pending() || self.toe_off.do_toe_off() {
            return;
        }

        let trailing = side.opposite();
        let trailing_polygon = support.feet.get(trailing).clone();

        if self.toe_off.request_toe_off_based_on_ecmp(
            self.ctx.desired_cmp,
            inputs.capture_point,
            &trailing_polygon,
        ) {
            contacts.set_state(trailing, ContactState::ToeLine);
            outputs.contact_changes.push((trailing, ContactState::ToeLine));
            *support = compute_support_polygons(contacts, &inputs.foot_poses);
        }
    }

    // ------------------------------------------------------------------
    // single support
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn enter_single_support(
        &mut self,
        support_side: Side,
        inputs: &TickInputs,
        switches: &mut FootSwitches,
        foot_pose_requests: &mut FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        let swing_side = support_side.opposite();

        self.ctx.capture_time = 0.0;
        self.ctx.has_icp_planner_finished = false;
        self.ctx.trailing_leg = None;

        switches.0.get_mut(swing_side).reset();

        self.ctx.transfer_from_desired_footstep = self.ctx.next_footstep.take();
        if self.push_recovery.is_enabled()
            && self.push_recovery.is_recovering_from_double_support_fall()
        {
            self.ctx.next_footstep = self.push_recovery.recover_from_double_support_footstep();
        } else {
            self.ctx.next_footstep = self.queue.next_footstep().cloned();
            self.timing.update_swing_time(self.ctx.next_footstep.as_ref());
        }

        self.exploration
            .initialize(self.ctx.next_footstep.as_ref(), swing_side, now);

        if self.ctx.next_footstep.is_none() {
            if let Some(request) = foot_pose_requests.take(swing_side) {
                self.ctx.icp_stand_offset = Vector2::zeros();
                self.ctx.is_in_flamingo_stance = true;
                outputs.foot_pose_motions.push((swing_side, request));
            }
        }

        self.ctx.support_leg = Some(support_side);
        self.timing.update_transfer_time(self.ctx.next_footstep.as_ref());

        if let Some(next_footstep) = self.ctx.next_footstep.clone() {
            self.update_footstep_parameters(&next_footstep, swing_side, inputs, contacts, support);

            let mut data = self.create_transfer_data_for_single_support(
                next_footstep,
                swing_side,
                inputs,
                contacts,
            );
            data.transfer_from_desired_footstep = self.ctx.transfer_from_desired_footstep.clone();
            self.planner.initialize_single_support(&data, now);
        }

        // the swing foot is unloaded from here on
        contacts.set_in_contact(swing_side, false);
        *support = compute_support_polygons(contacts, &inputs.foot_poses);
    }

    /// Refresh everything that depends on the footstep being executed.
    fn update_footstep_parameters(
        &mut self,
        next_footstep: &Footstep,
        swing_side: Side,
        inputs: &TickInputs,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
    ) {
        self.ctx.transfer_to_footstep_location = next_footstep.position2d();
        self.ctx.support_leg = Some(swing_side.opposite());

        // contact points at touch-down come from the footstep when predicted
        contacts.set_flat(swing_side, next_footstep.predicted_contact_points.as_deref());
        *support = compute_support_polygons(contacts, &inputs.foot_poses);

        let data = self.create_transfer_data_for_single_support(
            next_footstep.clone(),
            swing_side,
            inputs,
            contacts,
        );
        self.height
            .initialize(&data, self.ctx.support_leg, Some(next_footstep));

        self.ctx.ready_to_grab_next_footstep = true;
        debug!(?swing_side, "footstep parameters updated");
    }

    #[allow(clippy::too_many_arguments)]
    fn do_single_support_action(
        &mut self,
        support_side: Side,
        inputs: &TickInputs,
        foot_pose_requests: &mut FootPoseRequests,
        contacts: &mut ContactStates,
        support: &mut SupportPolygons,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        let swing_side = support_side.opposite();
        let time_in_state = self.time_in_state(now);

        outputs.integrate_swing_ankles = Some(swing_side);

        let mut desired = self
            .planner
            .desired_icp_at(inputs.capture_point, now + self.ctx.icp_projection_time_offset);

        if self.ctx.is_in_flamingo_stance {
            if let Some(request) = foot_pose_requests.take(swing_side) {
                outputs.foot_pose_motions.push((swing_side, request));
            }
        }

        let swing_time_remaining = self.timing.swing_time() - time_in_state;

        if let Some(mut footstep) = self
            .ctx
            .next_footstep
            .clone()
            .filter(|_| self.push_recovery.is_enabled())
        {
            let support_polygon = support.feet.get(support_side).clone();

            let adjusted = self.push_recovery.check_and_update_footstep(
                swing_side,
                swing_time_remaining,
                &mut footstep,
                &support_polygon,
            );

            if adjusted {
                self.queue.patch_next_position_xy(footstep.position2d());
                self.ctx.next_footstep = Some(footstep.clone());

                if self.push_recovery.is_recovering_from_double_support_fall() {
                    if let Some(mut neutral) = self.ctx.neutral_footsteps_data.clone() {
                        neutral.transfer_to_side = Some(swing_side.opposite());
                        self.planner.initialize_double_support(&neutral, now);
                    }
                }

                self.update_footstep_parameters(&footstep, swing_side, inputs, contacts, support);
                self.ctx.capture_time = time_in_state;

                let data = self.create_transfer_data_for_single_support(
                    footstep.clone(),
                    swing_side,
                    inputs,
                    contacts,
                );

                if self.push_recovery.is_recovering_from_double_support_fall() {
                    self.planner.update_plan_for_double_support_push(
                        &data,
                        inputs.capture_point,
                        now - self.ctx.capture_time,
                    );
                } else {
                    self.planner.update_plan_for_single_support_push(
                        &data,
                        inputs.capture_point,
                        now,
                    );
                }

                self.collapse_remaining_plan_to_stand(&footstep, swing_side);
            }
        }

        if !self.ctx.is_in_flamingo_stance {
            self.move_icp_to_inside_of_foot_at_end_of_swing(
                support_side,
                self.ctx.transfer_to_footstep_location,
                support,
                inputs,
                self.timing.swing_time(),
                swing_time_remaining,
                &mut desired.position,
            );
        }

        self.ctx.desired_icp = desired.position;
        if self.ctx.is_in_flamingo_stance {
            self.ctx.desired_icp += self.ctx.icp_stand_offset;
        }
        self.ctx.desired_icp_velocity = desired.velocity;
        self.ctx.desired_ecmp = desired.ecmp;

        // escape a straightening swing knee early in the step, while there is
        // still time to bend it before touch-down
        let near_singularity = *inputs.leg_lengths.get(swing_side)
            > self.config.height.singularity_fraction * self.config.height.max_leg_length;
        if time_in_state - self.ctx.capture_time < 0.5 * self.timing.swing_time()
            && near_singularity
        {
            outputs
                .knee_actions
                .push((swing_side, KneeAction::SingularityEscape));
        }
    }

    /// Replace whatever is still queued with a single stand step next to the
    /// recovery footstep.
    fn collapse_remaining_plan_to_stand(&mut self, recovery_step: &Footstep, swing_side: Side) {
        // providers streaming a step every tick would fight the collapse
        if self.queue.footsteps_to_provide() > FOOTSTEP_PROVIDER_STREAM_GUARD {
            return;
        }

        self.queue.clear_pending();

        let lateral = match swing_side {
            Side::Left => -RECOVERY_STAND_OFFSET,
            Side::Right => RECOVERY_STAND_OFFSET,
        };

        let mut stand_pose = recovery_step.pose;
        let offset = stand_pose.rotation * nalgebra::Vector3::new(0.0, lateral, 0.0);
        stand_pose.translation.vector += offset;

        let stand_step = Footstep::at_pose(swing_side.opposite(), stand_pose);
        self.queue.push_pending(stand_step);
    }

    fn exit_single_support(
        &mut self,
        support_side: Side,
        inputs: &TickInputs,
        outputs: &mut TickOutputs,
        now: f32,
    ) {
        let swing_side = support_side.opposite();

        if !self.ctx.is_in_flamingo_stance {
            let actual_pose = *inputs.foot_poses.0.get(swing_side);
            if let Some((footstep, pose)) = self.queue.notify_complete(Some(actual_pose)) {
                outputs.completed_footsteps.push((footstep, pose));
            }
        }
        self.ctx.is_in_flamingo_stance = false;

        if self.push_recovery.is_enabled() {
            if self.push_recovery.use_icp_planner_reset() && self.push_recovery.is_recovering() {
                self.planner
                    .reset(now - (self.ctx.icp_projection_time_offset + self.ctx.capture_time));
            }

            self.ctx.capture_time = 0.0;
            self.push_recovery.reset();
            self.ctx.icp_projection_time_offset = 0.0;
        }

        self.ctx.previous_support_side = Some(support_side);

        if self.config.reset_integrators_after_swing {
            outputs.reset_leg_integrators = Some(swing_side);
        }
    }

    // ------------------------------------------------------------------
    // shared helpers
    // ------------------------------------------------------------------

    /// Shape the desired ICP towards the inside of the stance foot as the
    /// swing ends, so the weight shift to the landing foot starts early.
    #[allow(clippy::too_many_arguments)]
    fn move_icp_to_inside_of_foot_at_end_of_swing(
        &self,
        support_side: Side,
        upcoming_footstep_location: Point2<f32>,
        support: &SupportPolygons,
        inputs: &TickInputs,
        swing_time: f32,
        swing_time_remaining: f32,
        desired_icp: &mut Point2<f32>,
    ) {
        let stance_centroid = support
            .feet
            .get(support_side)
            .centroid_or(foot_position2d(inputs, support_side));

        let stance_to_icp = *desired_icp - stance_centroid;
        let stance_to_swing = upcoming_footstep_location - stance_centroid;

        let stance_to_swing_distance = stance_to_swing.norm();
        if stance_to_swing_distance < MINIMUM_STANCE_TO_SWING_DISTANCE {
            return;
        }
        let direction = stance_to_swing / stance_to_swing_distance;

        let distance_along_line = direction.dot(&stance_to_icp);

        let time_before_shift = self
            .config
            .single_support_time_left_before_shift
            .max(0.01);

        let delta_time = swing_time - time_before_shift;
        let percent = if delta_time <= 1e-7 {
            1.0
        } else {
            ((swing_time - swing_time_remaining) / delta_time).clamp(0.0, 1.0)
        };

        let max_during = self
            .config
            .move_icp_away_during_swing_distance
            .clamp(0.0, stance_to_swing_distance / 2.0);
        let during_swing_distance = percent * max_during;

        let amount_to_move = if swing_time_remaining > time_before_shift {
            during_swing_distance
        } else {
            let end_percent = (1.0 - swing_time_remaining / time_before_shift).clamp(0.0, 1.0);
            let mut max_at_end = self
                .config
                .move_icp_away_at_end_of_swing_distance
                .clamp(0.0, stance_to_swing_distance / 2.0)
                - self.config.move_icp_away_during_swing_distance;
            if max_at_end < 0.0 {
                max_at_end = 0.0;
            }

            during_swing_distance + end_percent * max_at_end
        };

        // already shifted at least that far, nothing to do
        if distance_along_line > amount_to_move {
            return;
        }

        let additional_distance = amount_to_move - distance_along_line;
        *desired_icp += direction * additional_distance;
    }

    fn compute_momentum_command(
        &mut self,
        inputs: &TickInputs,
        contacts: &ContactStates,
        support: &SupportPolygons,
        outputs: &mut TickOutputs,
    ) {
        let keep_cmp_inside_support_polygon = true;
        self.ctx.desired_cmp = self.icp_feedback.compute_desired_cmp(
            inputs.capture_point,
            self.ctx.desired_icp,
            self.ctx.desired_icp_velocity,
            inputs.omega0,
            &support.combined,
            keep_cmp_inside_support_polygon,
        );

        let feet_flat = SideDependent::new(
            contacts.foot(Side::Left).state == ContactState::Flat
                && contacts.foot(Side::Left).in_contact,
            contacts.foot(Side::Right).state == ContactState::Flat
                && contacts.foot(Side::Right).in_contact,
        );

        let height_inputs = HeightInputs {
            com_position: inputs.com.position,
            com_velocity: inputs.com.velocity,
            pelvis_position: inputs.pelvis.position,
            desired_icp_velocity: self.ctx.desired_icp_velocity,
            omega0: inputs.omega0,
            leg_lengths: inputs.leg_lengths,
            feet_flat,
        };

        let command = self.height.compute(&height_inputs);

        outputs.desired_icp = self.ctx.desired_icp;
        outputs.desired_icp_velocity = self.ctx.desired_icp_velocity;
        outputs.desired_ecmp = self.ctx.desired_ecmp;
        outputs.desired_cmp = self.ctx.desired_cmp;
        outputs.height_acceleration = command.acceleration;
        outputs
            .knee_actions
            .extend(command.knee_actions.iter().copied());
    }

    /// A footstep describing where a foot currently stands, carrying its
    /// active contact points.
    fn footstep_at_current_location(
        &self,
        side: Side,
        inputs: &TickInputs,
        contacts: &ContactStates,
    ) -> Footstep {
        let mut footstep = Footstep::at_pose(side, *inputs.foot_poses.0.get(side));
        footstep.predicted_contact_points =
            Some(contacts.foot(side).points_in_sole().to_vec());
        footstep
    }

    fn create_transfer_data_for_double_support(
        &self,
        transfer_to: Side,
        in_initialize: bool,
        inputs: &TickInputs,
        contacts: &ContactStates,
    ) -> TransferToAndNextFootsteps {
        let transfer_from_footstep =
            self.footstep_at_current_location(transfer_to.opposite(), inputs, contacts);
        let transfer_to_footstep = self.footstep_at_current_location(transfer_to, inputs, contacts);
        let transfer_to_polygon = contacts.sole_polygon(transfer_to);

        let (next_footstep, next_next_footstep) = if in_initialize {
            // the executing footstep has not been popped yet
            (self.queue.next_next_footstep(), self.queue.next_next_next_footstep())
        } else {
            (
                self.queue.next_footstep().cloned(),
                self.queue.next_next_footstep(),
            )
        };

        let single_support_duration =
            self.timing.swing_time() + self.config.additional_swing_time_for_icp;
        let double_support_duration = self.timing.transfer_time();

        TransferToAndNextFootsteps {
            transfer_from_footstep,
            transfer_to_footstep,
            transfer_from_desired_footstep: None,
            next_footstep,
            next_next_footstep,
            transfer_to_side: Some(transfer_to),
            transfer_to_polygon_in_sole_frame: transfer_to_polygon,
            double_support_duration,
            single_support_duration,
            initial_transfer_duration: DOUBLE_SUPPORT_INITIAL_TRANSFER_DURATION,
            estimated_step_time: single_support_duration + double_support_duration,
            omega0: inputs.omega0,
            current_desired_icp: self.ctx.desired_icp,
            current_desired_icp_velocity: self.ctx.desired_icp_velocity,
            stop_if_reached_end: self.queue.footsteps_to_provide() <= STOP_IF_REACHED_END_WINDOW,
        }
    }

    fn create_transfer_data_for_single_support(
        &self,
        transfer_to_footstep: Footstep,
        swing_side: Side,
        inputs: &TickInputs,
        contacts: &ContactStates,
    ) -> TransferToAndNextFootsteps {
        let transfer_from_footstep =
            self.footstep_at_current_location(swing_side.opposite(), inputs, contacts);

        let transfer_to_polygon = match &transfer_to_footstep.predicted_contact_points {
            Some(points) if !points.is_empty() => ConvexPolygon2::from_points(points),
            _ => contacts.sole_polygon(swing_side),
        };

        let single_support_duration =
            self.timing.swing_time() + self.config.additional_swing_time_for_icp;
        let double_support_duration = self.timing.transfer_time();

        TransferToAndNextFootsteps {
            transfer_from_footstep,
            transfer_to_footstep,
            transfer_from_desired_footstep: None,
            next_footstep: self.queue.next_next_footstep(),
            next_next_footstep: self.queue.next_next_next_footstep(),
            transfer_to_side: Some(swing_side),
            transfer_to_polygon_in_sole_frame: transfer_to_polygon,
            double_support_duration,
            single_support_duration,
            initial_transfer_duration: DOUBLE_SUPPORT_INITIAL_TRANSFER_DURATION,
            estimated_step_time: single_support_duration + double_support_duration,
            omega0: inputs.omega0,
            current_desired_icp: self.ctx.desired_icp,
            current_desired_icp_velocity: self.ctx.desired_icp_velocity,
            stop_if_reached_end: self.queue.footsteps_to_provide() <= STOP_IF_REACHED_END_WINDOW,
        }
    }

}

fn foot_position2d(inputs: &TickInputs, side: Side) -> Point2<f32> {
    let translation = inputs.foot_poses.0.get(side).translation.vector;
    Point2::new(translation.x, translation.y)
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point2, Vector2};

    use super::{TickInputs, TickOutputs, WalkingMachine, WalkingState};
    use crate::{
        contact::{ContactStates, FootPoses, SupportPolygons, compute_support_polygons},
        estimation::{
            CenterOfMassState, FootLoad, FootSwitches, LegExtensions, PelvisState,
        },
        footstep::{Footstep, FootstepProvider, Side, SideDependent},
        walking::{FootPoseRequests, WalkingConfig, WalkingContext, conditions},
    };

    const DT: f32 = 0.004;

    /// Drives a [`WalkingMachine`] tick by tick with the measured capture
    /// point tracking the desired one.
    struct Harness {
        machine: WalkingMachine,
        switches: FootSwitches,
        requests: FootPoseRequests,
        contacts: ContactStates,
        support: SupportPolygons,
        foot_poses: FootPoses,
        capture_point: Point2<f32>,
        capture_offset: Vector2<f32>,
        now: f32,
    }

    impl Harness {
        fn new() -> Self {
            let config = WalkingConfig::default();
            let mut machine = WalkingMachine::new(config, DT).expect("valid test config");
            machine.initialize(Point2::origin());

            let contacts = ContactStates::default();
            let foot_poses = FootPoses(SideDependent::new(
                Isometry3::translation(0.0, 0.1, 0.0),
                Isometry3::translation(0.0, -0.1, 0.0),
            ));
            let support = compute_support_polygons(&contacts, &foot_poses);

            Self {
                machine,
                switches: FootSwitches::default(),
                requests: FootPoseRequests::default(),
                contacts,
                support,
                foot_poses,
                capture_point: Point2::origin(),
                capture_offset: Vector2::zeros(),
                now: 0.0,
            }
        }

        fn provider(&self) -> FootstepProvider {
            self.machine.queue.provider()
        }

        fn tick(&mut self) -> TickOutputs {
            self.now += DT;

            let inputs = TickInputs {
                now: self.now,
                capture_point: self.capture_point,
                omega0: 3.5,
                com: CenterOfMassState::default(),
                pelvis: PelvisState::default(),
                foot_poses: self.foot_poses,
                leg_lengths: LegExtensions::default().0,
                stop_requested: false,
            };

            let mut outputs = TickOutputs::default();
            self.machine.tick(
                &inputs,
                &mut self.switches,
                &mut self.requests,
                &mut self.contacts,
                &mut self.support,
                &mut outputs,
            );

            // the "robot" tracks the plan up to a configurable offset
            self.capture_point = outputs.desired_icp + self.capture_offset;
            outputs
        }

        fn run_for(&mut self, seconds: f32) {
            let ticks = (seconds / DT) as usize;
            for _ in 0..ticks {
                self.tick();
            }
        }

        fn footstep(side: Side, x: f32, y: f32) -> Footstep {
            Footstep::at_pose(side, Isometry3::translation(x, y, 0.0))
        }
    }

    #[test]
    fn idle_machine_stays_in_double_support() {
        let mut harness = Harness::new();

        for _ in 0..500 {
            harness.tick();
            assert_eq!(harness.machine.state, WalkingState::DoubleSupport);
        }
    }

    #[test]
    fn queued_footstep_triggers_exactly_one_transfer() {
        let mut harness = Harness::new();
        // a right swing stands on the left leg first
        harness
            .provider()
            .push(Harness::footstep(Side::Right, 0.2, -0.1));

        let mut transfers_into_left = 0;
        let mut previous = harness.machine.state;
        let mut transition_time = None;

        for _ in 0..(1.0 / DT) as usize {
            harness.tick();
            let state = harness.machine.state;
            if previous != state && state == WalkingState::Transfer(Side::Left) {
                transfers_into_left += 1;
                transition_time.get_or_insert(harness.now);
            }
            previous = state;
        }

        assert_eq!(transfers_into_left, 1);
        // the transfer must not start before the double support time passed
        assert!(transition_time.expect("transfer happened") > 0.25);
    }

    #[test]
    fn transfer_hands_over_only_below_the_icp_error_gate() {
        let mut harness = Harness::new();
        harness
            .provider()
            .push(Harness::footstep(Side::Right, 0.2, -0.1));

        // settle through the stand plan, into the transfer
        harness.run_for(0.6);
        assert_eq!(harness.machine.state, WalkingState::Transfer(Side::Left));

        // 4 cm of tracking error blocks single support even once the ICP
        // trajectory finishes
        harness.capture_offset = Vector2::new(0.0, 0.04);
        harness.run_for(0.8);
        assert!(harness.machine.ctx.icp_trajectory_initialized);
        assert_eq!(harness.machine.state, WalkingState::Transfer(Side::Left));

        // 3 cm is close enough
        harness.capture_offset = Vector2::new(0.0, 0.03);
        harness.run_for(0.3);
        assert_eq!(
            harness.machine.state,
            WalkingState::SingleSupport(Side::Left)
        );
    }

    #[test]
    fn capture_point_escape_forces_a_recovery_single_support() {
        let mut harness = Harness::new();
        harness.run_for(0.1);

        // shove the capture point far out to the left
        harness.capture_offset = Vector2::new(0.0, 0.4);
        harness.tick();
        harness.tick();

        assert_eq!(
            harness.machine.state,
            WalkingState::SingleSupport(Side::Right)
        );
        let recovery = harness
            .machine
            .ctx
            .next_footstep
            .as_ref()
            .expect("a recovery step is executing");
        assert_eq!(recovery.side, Side::Left);
    }

    #[test]
    fn minimum_swing_fraction_gates_the_touch_down() {
        let harness = Harness::new();
        let config = WalkingConfig::default();
        let mut ctx = harness.machine.ctx.clone();

        let mut switches = FootSwitches::default();
        // the right swing foot firmly on the ground
        switches.0.get_mut(Side::Right).update(
            &FootLoad {
                total: 0.8,
                toe: 0.8,
                heel: 0.8,
                cop: Some(Point2::origin()),
            },
            &config.estimation,
        );

        let done_at = |time_in_state: f32, ctx: &mut WalkingContext| {
            conditions::done_with_single_support(
                &config,
                ctx,
                &harness.machine.planner,
                &harness.machine.push_recovery,
                &harness.machine.exploration,
                &harness.machine.timing,
                &switches,
                Side::Left,
                10.0,
                time_in_state,
            )
        };

        // swing time 0.7 s, minimum fraction 0.5: contact before 0.35 s in
        // state must not finish the step
        assert!(!done_at(0.3, &mut ctx));
        assert!(done_at(0.36, &mut ctx));
    }
}
