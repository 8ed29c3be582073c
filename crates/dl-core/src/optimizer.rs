//! Request/response boundary to the pose-graph optimizer.
//!
//! The optimizer decides how drift is corrected. This crate only feeds it
//! the anchor graph and consumes its fragment decisions; it never looks at
//! the optimizer's internal state beyond the calls on [`Optimizer`].

use crate::error::OptimizerError;
use crate::ids::{AnchorId, Edge, FragmentId};
use crate::pose::Pose;
use crate::vector::Vec3;

/// Located anchor as submitted each tick, in the spongy frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnchorPose {
    pub id: AnchorId,
    pub pose: Pose,
}

/// Where an attachment point hangs: an anchor of a fragment plus an offset
/// from that anchor, expressed in locked space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnchorBinding {
    pub fragment: FragmentId,
    pub anchor: AnchorId,
    pub offset: Vec3,
}

/// One source fragment absorbed by a merge, with the pose that carries its
/// contents into the target fragment's frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FragmentAdjustment {
    pub fragment: FragmentId,
    pub adjustment: Pose,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeResult {
    pub target: FragmentId,
    pub sources: Vec<FragmentAdjustment>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RefreezeResult {
    pub target: FragmentId,
    pub absorbed: Vec<FragmentId>,
}

/// Per-point outcome of a refreeze: the new binding and the pose delta that
/// moves the point's old locked position to its new one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointAdjustment {
    pub binding: AnchorBinding,
    pub adjustment: Pose,
}

pub trait Optimizer {
    /// Hand over the full located anchor set, edges created since the last
    /// successful submission, and the anchor nearest the device.
    fn submit_graph(
        &mut self,
        anchors: &[AnchorPose],
        new_edges: &[Edge],
        most_significant: AnchorId,
    ) -> Result<(), OptimizerError>;

    fn merge_indicated(&self) -> bool;

    fn refreeze_indicated(&self) -> bool;

    /// Merge fragments connected to the current one. `None` if nothing merged.
    fn merge(&mut self) -> Option<MergeResult>;

    /// Re-solve the current fragment, absorbing connected ones. `None` on failure.
    fn refreeze(&mut self) -> Option<RefreezeResult>;

    /// Fragment containing the device, or unknown.
    fn current_fragment(&self) -> FragmentId;

    /// `locked_from_spongy` for the current fragment.
    fn correction_pose(&self) -> Pose;

    /// Anchor-proximity query: bind a locked-space position to its nearest
    /// anchor. With a context binding, the search stays in that fragment.
    fn bind_attachment(
        &self,
        locked_position: Vec3,
        context: Option<&AnchorBinding>,
    ) -> Option<AnchorBinding>;

    /// New binding and pose delta for a point after a refreeze.
    fn adjust_attachment(&self, binding: &AnchorBinding) -> Option<PointAdjustment>;

    /// Drop all state. Called when the stabilizer is reset.
    fn reset(&mut self) {}
}
