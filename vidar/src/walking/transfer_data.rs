use nalgebra::{Point2, Point3, Vector2};

use crate::{
    footstep::{Footstep, Side},
    geometry::ConvexPolygon2,
};

/// Per-tick snapshot of everything a planning call needs to know about the
/// current and upcoming footsteps.
///
/// Built fresh for every planner (re)initialization and owned exclusively by
/// the caller; never retained across ticks.
#[derive(Debug, Clone)]
pub struct TransferToAndNextFootsteps {
    /// The footstep we are transferring weight away from.
    pub transfer_from_footstep: Footstep,
    /// The footstep we are transferring weight onto.
    pub transfer_to_footstep: Footstep,
    /// Where the swing foot was *planned* to be before lift-off, when that
    /// differs from where it actually is.
    pub transfer_from_desired_footstep: Option<Footstep>,
    pub next_footstep: Option<Footstep>,
    pub next_next_footstep: Option<Footstep>,
    /// Side the weight is moving towards; `None` when settling into a stand.
    pub transfer_to_side: Option<Side>,
    /// Contact polygon of the transfer-to foot, in its sole frame.
    pub transfer_to_polygon_in_sole_frame: ConvexPolygon2,
    pub double_support_duration: f32,
    pub single_support_duration: f32,
    /// Duration of the very first weight shift after standing still.
    pub initial_transfer_duration: f32,
    pub estimated_step_time: f32,
    pub omega0: f32,
    pub current_desired_icp: Point2<f32>,
    pub current_desired_icp_velocity: Vector2<f32>,
    /// Whether the plan should settle instead of keeping momentum for further
    /// steps.
    pub stop_if_reached_end: bool,
}

impl TransferToAndNextFootsteps {
    /// Contact polygon of the transfer-to foot in the world frame.
    #[must_use]
    pub fn transfer_to_polygon_world(&self) -> ConvexPolygon2 {
        let pose = &self.transfer_to_footstep.pose;
        let points: Vec<Point2<f32>> = self
            .transfer_to_polygon_in_sole_frame
            .vertices()
            .iter()
            .map(|point| {
                let world = pose.transform_point(&Point3::new(point.x, point.y, 0.0));
                Point2::new(world.x, world.y)
            })
            .collect();

        ConvexPolygon2::from_points(&points)
    }

    /// Horizontal position of the stance after the upcoming swing: the next
    /// footstep when there is one, otherwise the foot we are leaving behind.
    #[must_use]
    pub fn upcoming_stance_position(&self) -> Point2<f32> {
        self.next_footstep
            .as_ref()
            .map_or_else(|| self.transfer_from_footstep.position2d(), Footstep::position2d)
    }
}
