//! Per-foot contact states and the support polygons derived from them.
//!
//! Contact states change mid-tick (toe-off, touch-down): every change MUST be
//! followed by a support polygon rebuild before any downstream geometry is
//! computed, which is why [`compute_support_polygons`] is a pure function the
//! state machine can re-run immediately.

use bevy::prelude::*;
use nalgebra::{Isometry2, Isometry3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

use crate::{
    footstep::{Side, SideDependent},
    geometry::ConvexPolygon2,
    prelude::ControlSet,
};

/// Contact interface of one foot with the ground.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// Whole sole in contact.
    #[default]
    Flat,
    /// Heel edge only (toe touch-down pending).
    HeelLine,
    /// Toe edge line contact (toe-off).
    ToeLine,
    /// Single toe point contact (late toe-off).
    ToePoint,
}

/// Sole outline used to build contact polygons, in the sole frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct FootGeometry {
    /// Distance from the sole origin to the toe edge, in meters.
    pub toe_x: f32,
    /// Distance from the sole origin to the heel edge, in meters (negative).
    pub heel_x: f32,
    /// Half the sole width, in meters.
    pub half_width: f32,
}

impl Default for FootGeometry {
    fn default() -> Self {
        Self {
            toe_x: 0.09,
            heel_x: -0.05,
            half_width: 0.045,
        }
    }
}

impl FootGeometry {
    /// Contact points for the given contact state, in the sole frame.
    #[must_use]
    pub fn contact_points(&self, state: ContactState) -> Vec<Point2<f32>> {
        match state {
            ContactState::Flat => vec![
                Point2::new(self.toe_x, self.half_width),
                Point2::new(self.toe_x, -self.half_width),
                Point2::new(self.heel_x, -self.half_width),
                Point2::new(self.heel_x, self.half_width),
            ],
            ContactState::HeelLine => vec![
                Point2::new(self.heel_x, self.half_width),
                Point2::new(self.heel_x, -self.half_width),
            ],
            ContactState::ToeLine => vec![
                Point2::new(self.toe_x, self.half_width),
                Point2::new(self.toe_x, -self.half_width),
            ],
            ContactState::ToePoint => vec![Point2::new(self.toe_x, 0.0)],
        }
    }
}

/// Contact description of one foot.
#[derive(Debug, Clone, PartialEq)]
pub struct FootContact {
    pub state: ContactState,
    pub in_contact: bool,
    /// Active contact points in the sole frame.
    points: Vec<Point2<f32>>,
}

impl FootContact {
    fn new(geometry: &FootGeometry) -> Self {
        Self {
            state: ContactState::Flat,
            in_contact: true,
            points: geometry.contact_points(ContactState::Flat),
        }
    }

    #[must_use]
    pub fn points_in_sole(&self) -> &[Point2<f32>] {
        &self.points
    }
}

/// Contact states of both feet.
#[derive(Resource, Debug, Clone)]
pub struct ContactStates {
    feet: SideDependent<FootContact>,
    geometry: FootGeometry,
}

impl Default for ContactStates {
    fn default() -> Self {
        Self::new(FootGeometry::default())
    }
}

impl ContactStates {
    #[must_use]
    pub fn new(geometry: FootGeometry) -> Self {
        Self {
            feet: SideDependent::new(FootContact::new(&geometry), FootContact::new(&geometry)),
            geometry,
        }
    }

    #[must_use]
    pub fn foot(&self, side: Side) -> &FootContact {
        self.feet.get(side)
    }

    #[must_use]
    pub fn geometry(&self) -> &FootGeometry {
        &self.geometry
    }

    /// Switch the contact state of a foot, rebuilding its default contact
    /// points. Returns whether anything changed.
    pub fn set_state(&mut self, side: Side, state: ContactState) -> bool {
        let foot = self.feet.get_mut(side);
        if foot.state == state {
            return false;
        }

        foot.state = state;
        foot.points = self.geometry.contact_points(state);
        true
    }

    /// Put a foot flat, using the footstep's predicted contact points when it
    /// carries any, the full default sole polygon otherwise.
    pub fn set_flat(&mut self, side: Side, predicted: Option<&[Point2<f32>]>) {
        let points = match predicted {
            Some(points) if !points.is_empty() => points.to_vec(),
            _ => self.geometry.contact_points(ContactState::Flat),
        };

        let foot = self.feet.get_mut(side);
        foot.state = ContactState::Flat;
        foot.points = points;
    }

    pub fn set_in_contact(&mut self, side: Side, in_contact: bool) {
        self.feet.get_mut(side).in_contact = in_contact;
    }

    #[must_use]
    pub fn any_in_contact(&self) -> bool {
        self.feet.left.in_contact || self.feet.right.in_contact
    }

    /// Contact polygon of one foot in the sole frame.
    #[must_use]
    pub fn sole_polygon(&self, side: Side) -> ConvexPolygon2 {
        ConvexPolygon2::from_points(self.foot(side).points_in_sole())
    }
}

/// Support polygons rebuilt from the current contact points.
#[derive(Resource, Debug, Clone, Default)]
pub struct SupportPolygons {
    /// Union of both feet, world frame.
    pub combined: ConvexPolygon2,
    /// Per-foot contact polygons, world frame.
    pub feet: SideDependent<ConvexPolygon2>,
}

/// Current foot sole poses in the world frame, written by the upstream
/// kinematics.
#[derive(Resource, Debug, Clone, Copy)]
pub struct FootPoses(pub SideDependent<Isometry3<f32>>);

impl Default for FootPoses {
    fn default() -> Self {
        let left = Isometry3::translation(0.0, 0.05, 0.0);
        let right = Isometry3::translation(0.0, -0.05, 0.0);
        Self(SideDependent::new(left, right))
    }
}

/// Project the sole-frame contact points of one foot into the world.
#[must_use]
pub fn foot_points_in_world(
    contact: &FootContact,
    pose: &Isometry3<f32>,
) -> Vec<Point2<f32>> {
    contact
        .points_in_sole()
        .iter()
        .map(|point| {
            let world = pose.transform_point(&Point3::new(point.x, point.y, 0.0));
            Point2::new(world.x, world.y)
        })
        .collect()
}

/// Rebuild the support polygons from the current contact states and foot
/// poses.
#[must_use]
pub fn compute_support_polygons(
    contacts: &ContactStates,
    poses: &FootPoses,
) -> SupportPolygons {
    let mut combined_points = Vec::with_capacity(8);
    let mut feet = SideDependent::<ConvexPolygon2>::default();

    for side in [Side::Left, Side::Right] {
        let foot = contacts.foot(side);
        if !foot.in_contact {
            continue;
        }

        let points = foot_points_in_world(foot, poses.0.get(side));
        *feet.get_mut(side) = ConvexPolygon2::from_points(&points);
        combined_points.extend(points);
    }

    SupportPolygons {
        combined: ConvexPolygon2::from_points(&combined_points),
        feet,
    }
}

/// Frame centered between the feet, x towards the average foot heading.
#[must_use]
pub fn mid_feet_frame(poses: &FootPoses) -> Isometry2<f32> {
    let left = poses.0.get(Side::Left);
    let right = poses.0.get(Side::Right);

    let center = (left.translation.vector.xy() + right.translation.vector.xy()) / 2.0;

    let left_yaw = left.rotation.euler_angles().2;
    let right_yaw = right.rotation.euler_angles().2;
    // average headings through unit vectors, robust to angle wrapping
    let heading = Vector2::new(
        left_yaw.cos() + right_yaw.cos(),
        left_yaw.sin() + right_yaw.sin(),
    );
    let yaw = heading.y.atan2(heading.x);

    Isometry2::new(center, yaw)
}

/// Request for a contact-state change, consumed by the downstream whole-body
/// controller.
#[derive(Event, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactChangeRequest {
    pub side: Side,
    pub state: ContactState,
}

/// Plugin maintaining contact states and support polygons.
pub struct ContactPlugin;

impl Plugin for ContactPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<ContactStates>()
            .init_resource::<SupportPolygons>()
            .init_resource::<FootPoses>();
        app.add_event::<ContactChangeRequest>();

        app.add_systems(
            Update,
            update_support_polygons
                .after(crate::estimation::update_foot_switches)
                .in_set(ControlSet::Estimate),
        );
    }
}

fn update_support_polygons(
    mut polygons: ResMut<SupportPolygons>,
    contacts: Res<ContactStates>,
    poses: Res<FootPoses>,
) {
    *polygons = compute_support_polygons(&contacts, &poses);
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point2};

    use super::{
        ContactState, ContactStates, FootPoses, compute_support_polygons, mid_feet_frame,
    };
    use crate::footstep::{Side, SideDependent};

    #[test]
    fn toe_off_reduces_contact_to_a_line() {
        let mut contacts = ContactStates::default();
        assert!(contacts.set_state(Side::Left, ContactState::ToeLine));
        assert_eq!(contacts.foot(Side::Left).points_in_sole().len(), 2);

        // same state again is a no-op
        assert!(!contacts.set_state(Side::Left, ContactState::ToeLine));
    }

    #[test]
    fn predicted_contact_points_replace_the_default_sole() {
        let mut contacts = ContactStates::default();
        let predicted = [
            Point2::new(0.02, 0.01),
            Point2::new(0.02, -0.01),
            Point2::new(-0.02, 0.0),
        ];
        contacts.set_flat(Side::Right, Some(&predicted));
        assert_eq!(contacts.foot(Side::Right).points_in_sole().len(), 3);

        contacts.set_flat(Side::Right, None);
        assert_eq!(contacts.foot(Side::Right).points_in_sole().len(), 4);
    }

    #[test]
    fn support_polygon_spans_both_feet() {
        let contacts = ContactStates::default();
        let poses = FootPoses(SideDependent::new(
            Isometry3::translation(0.0, 0.1, 0.0),
            Isometry3::translation(0.0, -0.1, 0.0),
        ));

        let polygons = compute_support_polygons(&contacts, &poses);
        assert!(!polygons.combined.is_degenerate());
        assert!(polygons.combined.contains(&Point2::new(0.0, 0.0)));
        assert!(polygons.feet.left.contains(&Point2::new(0.0, 0.1)));
    }

    #[test]
    fn lifted_foot_leaves_the_support_polygon() {
        let mut contacts = ContactStates::default();
        contacts.set_in_contact(Side::Left, false);

        let poses = FootPoses(SideDependent::new(
            Isometry3::translation(0.0, 0.1, 0.0),
            Isometry3::translation(0.0, -0.1, 0.0),
        ));

        let polygons = compute_support_polygons(&contacts, &poses);
        assert!(!polygons.combined.contains(&Point2::new(0.0, 0.1)));
        assert!(polygons.feet.left.is_empty());
    }

    #[test]
    fn mid_feet_frame_sits_between_the_feet() {
        let poses = FootPoses(SideDependent::new(
            Isometry3::translation(1.0, 0.1, 0.0),
            Isometry3::translation(1.0, -0.1, 0.0),
        ));

        let frame = mid_feet_frame(&poses);
        let local = frame.inverse_transform_point(&Point2::new(1.0, 0.0));
        assert!(local.coords.norm() < 1e-6);
    }
}
