//! Platform capability boundary for raw spatial anchors and device tracking.
//!
//! The anchor graph algorithm is written once against [`AnchorPlatform`];
//! each device stack plugs in through a small adapter.

use std::collections::HashMap;

use crate::pose::Pose;

/// Platform-side handle of a raw spatial anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpatialHandle(pub u64);

/// What the stabilizer needs from a tracking stack.
///
/// All poses are in the device's local ("spongy") tracking frame.
pub trait AnchorPlatform {
    /// Whether the device is currently tracked. Loss is transient.
    fn is_tracking(&self) -> bool;

    /// Latest device (head) pose.
    fn device_pose(&self) -> Pose;

    /// Ask the platform for a new anchor. `None` if it cannot create one now.
    fn create_anchor(&mut self, pose: Pose) -> Option<SpatialHandle>;

    fn destroy_anchor(&mut self, handle: SpatialHandle);

    /// Current pose of a located anchor; `None` while not (yet) located.
    fn locate_anchor(&self, handle: SpatialHandle) -> Option<Pose>;
}

/// Adapter for builds with no tracking stack. Never tracks, never creates.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPlatform;

impl AnchorPlatform for NullPlatform {
    fn is_tracking(&self) -> bool {
        false
    }

    fn device_pose(&self) -> Pose {
        Pose::IDENTITY
    }

    fn create_anchor(&mut self, _pose: Pose) -> Option<SpatialHandle> {
        None
    }

    fn destroy_anchor(&mut self, _handle: SpatialHandle) {}

    fn locate_anchor(&self, _handle: SpatialHandle) -> Option<Pose> {
        None
    }
}

#[derive(Clone, Debug)]
struct SimAnchor {
    pose: Pose,
    age: u32,
}

/// Scripted platform for tests and the simulation harness.
///
/// Anchors report located only after `settle_steps` calls to [`step`],
/// mimicking the settling delay of real devices.
///
/// [`step`]: SimulatedPlatform::step
#[derive(Clone, Debug)]
pub struct SimulatedPlatform {
    device: Pose,
    tracking: bool,
    settle_steps: u32,
    anchors: HashMap<u64, SimAnchor>,
    next_handle: u64,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedPlatform {
    pub fn new(settle_steps: u32) -> Self {
        Self {
            device: Pose::IDENTITY,
            tracking: true,
            settle_steps,
            anchors: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn set_device_pose(&mut self, pose: Pose) {
        self.device = pose;
    }

    pub fn set_tracking(&mut self, tracking: bool) {
        self.tracking = tracking;
    }

    pub fn set_settle_steps(&mut self, steps: u32) {
        self.settle_steps = steps;
    }

    /// Advance one frame; anchors age towards located.
    pub fn step(&mut self) {
        for anchor in self.anchors.values_mut() {
            anchor.age = anchor.age.saturating_add(1);
        }
    }

    /// Number of live platform anchors, located or not.
    pub fn live_anchors(&self) -> usize {
        self.anchors.len()
    }

    /// Displace every live anchor, e.g. to emulate tracking drift.
    pub fn shift_anchors(&mut self, delta: Pose) {
        for anchor in self.anchors.values_mut() {
            anchor.pose = delta * anchor.pose;
        }
    }
}

impl AnchorPlatform for SimulatedPlatform {
    fn is_tracking(&self) -> bool {
        self.tracking
    }

    fn device_pose(&self) -> Pose {
        self.device
    }

    fn create_anchor(&mut self, pose: Pose) -> Option<SpatialHandle> {
        if !self.tracking {
            return None;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.anchors.insert(handle, SimAnchor { pose, age: 0 });
        Some(SpatialHandle(handle))
    }

    fn destroy_anchor(&mut self, handle: SpatialHandle) {
        self.anchors.remove(&handle.0);
    }

    fn locate_anchor(&self, handle: SpatialHandle) -> Option<Pose> {
        if !self.tracking {
            return None;
        }
        self.anchors
            .get(&handle.0)
            .filter(|a| a.age >= self.settle_steps)
            .map(|a| a.pose)
    }
}
