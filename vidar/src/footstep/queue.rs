use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use nalgebra::{Isometry3, Point2};
use tracing::info;

use super::{Footstep, Side};

type SharedDeque = Arc<Mutex<VecDeque<Footstep>>>;

/// Producer handle for depositing planned footsteps into the queue.
///
/// The handle is the only asynchronous boundary of the controller: an external
/// planner or script clones it and appends from its own thread. The mutex is
/// held only for the enqueue itself, never across a control tick.
#[derive(Debug, Clone)]
pub struct FootstepProvider {
    shared: SharedDeque,
}

impl FootstepProvider {
    /// Append a footstep to the end of the plan.
    pub fn push(&self, footstep: Footstep) {
        self.shared
            .lock()
            .expect("footstep provider poisoned")
            .push_back(footstep);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .lock()
            .expect("footstep provider poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO of planned footsteps with next/next-next lookahead.
///
/// The queue owns each footstep from the moment it is deposited until the
/// state machine notifies completion. The consumer side is only ever touched
/// from within the control tick.
#[derive(Debug)]
pub struct FootstepQueue {
    shared: SharedDeque,
    /// The footstep currently grabbed for execution.
    next: Option<Footstep>,
}

impl Default for FootstepQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FootstepQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(VecDeque::new())),
            next: None,
        }
    }

    /// Create a producer handle for the external footstep source.
    #[must_use]
    pub fn provider(&self) -> FootstepProvider {
        FootstepProvider {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Grab the next footstep from the provider when the controller is ready
    /// for one.
    ///
    /// On a successful grab the ready flag is cleared and the upcoming support
    /// leg becomes the stance side of the grabbed step. Returns whether a new
    /// footstep was grabbed.
    pub fn check_for_footsteps(
        &mut self,
        ready_to_grab_next: &mut bool,
        upcoming_support_leg: &mut Side,
    ) -> bool {
        if !*ready_to_grab_next {
            return false;
        }

        let Some(footstep) = self
            .shared
            .lock()
            .expect("footstep provider poisoned")
            .pop_front()
        else {
            return false;
        };

        *upcoming_support_leg = footstep.side.opposite();
        *ready_to_grab_next = false;
        self.next = Some(footstep);

        true
    }

    /// The footstep currently grabbed for execution.
    #[must_use]
    pub fn next_footstep(&self) -> Option<&Footstep> {
        self.next.as_ref()
    }

    /// Lookahead one step past the grabbed footstep.
    #[must_use]
    pub fn next_next_footstep(&self) -> Option<Footstep> {
        self.peek(0)
    }

    /// Lookahead two steps past the grabbed footstep.
    #[must_use]
    pub fn next_next_next_footstep(&self) -> Option<Footstep> {
        self.peek(1)
    }

    fn peek(&self, index: usize) -> Option<Footstep> {
        self.shared
            .lock()
            .expect("footstep provider poisoned")
            .get(index)
            .cloned()
    }

    /// Re-target the grabbed footstep during push recovery.
    pub fn patch_next_position_xy(&mut self, position: Point2<f32>) {
        if let Some(footstep) = &mut self.next {
            footstep.patch_position_xy(position);
        }
    }

    /// Replace the grabbed footstep, e.g. with a recovery step.
    pub fn replace_next(&mut self, footstep: Footstep) {
        self.next = Some(footstep);
    }

    /// Insert a footstep at the front of the pending plan from the consumer
    /// side, e.g. the stand step closing out a recovery.
    pub fn push_pending(&mut self, footstep: Footstep) {
        self.shared
            .lock()
            .expect("footstep provider poisoned")
            .push_front(footstep);
    }

    /// Retire the grabbed footstep after touch-down.
    ///
    /// Returns the retired footstep so the caller can publish a completion
    /// notification carrying the actual touch-down pose.
    pub fn notify_complete(
        &mut self,
        actual_pose: Option<Isometry3<f32>>,
    ) -> Option<(Footstep, Option<Isometry3<f32>>)> {
        self.next.take().map(|footstep| (footstep, actual_pose))
    }

    /// Drop every footstep still waiting in the provider.
    ///
    /// Used when push recovery collapses the remaining plan into a stand.
    /// Returns the number of dropped footsteps.
    pub fn clear_pending(&mut self) -> usize {
        let mut deque = self.shared.lock().expect("footstep provider poisoned");
        let dropped = deque.len();
        deque.clear();
        if dropped > 0 {
            info!(dropped, "dropped pending footsteps");
        }
        dropped
    }

    /// Number of footsteps the queue can still provide, including the grabbed
    /// one.
    #[must_use]
    pub fn footsteps_to_provide(&self) -> usize {
        let pending = self
            .shared
            .lock()
            .expect("footstep provider poisoned")
            .len();
        pending + usize::from(self.next.is_some())
    }

    #[must_use]
    pub fn is_provider_empty(&self) -> bool {
        self.shared
            .lock()
            .expect("footstep provider poisoned")
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Isometry3;

    use super::FootstepQueue;
    use crate::footstep::{Footstep, Side};

    fn footstep(side: Side) -> Footstep {
        Footstep::at_pose(side, Isometry3::identity())
    }

    #[test]
    fn grab_clears_ready_flag_and_sets_support_leg() {
        let mut queue = FootstepQueue::new();
        queue.provider().push(footstep(Side::Left));

        let mut ready = true;
        let mut upcoming = Side::Left;
        assert!(queue.check_for_footsteps(&mut ready, &mut upcoming));

        assert!(!ready);
        assert_eq!(upcoming, Side::Right);
        assert_eq!(queue.next_footstep().map(|f| f.side), Some(Side::Left));
    }

    #[test]
    fn no_grab_without_ready_flag() {
        let mut queue = FootstepQueue::new();
        queue.provider().push(footstep(Side::Left));

        let mut ready = false;
        let mut upcoming = Side::Left;
        assert!(!queue.check_for_footsteps(&mut ready, &mut upcoming));
        assert!(queue.next_footstep().is_none());
        assert_eq!(upcoming, Side::Left);
    }

    #[test]
    fn lookahead_tracks_provider_order() {
        let mut queue = FootstepQueue::new();
        let provider = queue.provider();
        provider.push(footstep(Side::Left));
        provider.push(footstep(Side::Right));
        provider.push(footstep(Side::Left));

        let mut ready = true;
        let mut upcoming = Side::Left;
        queue.check_for_footsteps(&mut ready, &mut upcoming);

        assert_eq!(queue.next_footstep().map(|f| f.side), Some(Side::Left));
        assert_eq!(queue.next_next_footstep().map(|f| f.side), Some(Side::Right));
        assert_eq!(
            queue.next_next_next_footstep().map(|f| f.side),
            Some(Side::Left)
        );
        assert_eq!(queue.footsteps_to_provide(), 3);
    }

    #[test]
    fn completion_retires_the_grabbed_footstep() {
        let mut queue = FootstepQueue::new();
        queue.provider().push(footstep(Side::Right));

        let mut ready = true;
        let mut upcoming = Side::Left;
        queue.check_for_footsteps(&mut ready, &mut upcoming);

        let retired = queue.notify_complete(Some(Isometry3::identity()));
        assert_eq!(retired.map(|(f, _)| f.side), Some(Side::Right));
        assert!(queue.next_footstep().is_none());
        assert_eq!(queue.footsteps_to_provide(), 0);
    }

    #[test]
    fn clear_pending_keeps_the_grabbed_footstep() {
        let mut queue = FootstepQueue::new();
        let provider = queue.provider();
        for side in [Side::Left, Side::Right, Side::Left] {
            provider.push(footstep(side));
        }

        let mut ready = true;
        let mut upcoming = Side::Left;
        queue.check_for_footsteps(&mut ready, &mut upcoming);

        assert_eq!(queue.clear_pending(), 2);
        assert!(queue.next_footstep().is_some());
        assert!(queue.is_provider_empty());
    }
}
