use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{AnchorId, AttachmentId, FragmentId};
use crate::optimizer::AnchorBinding;
use crate::pose::Pose;
use crate::vector::Vec3;

/// Lifecycle of an attachment point.
///
/// `Pending` until first bound, then `Normal` while its fragment is current
/// and `Unconnected` otherwise. `Released` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    Pending,
    Normal,
    Unconnected,
    Released,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Normal => "normal",
            Self::Unconnected => "unconnected",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives the pose delta applied by a merge or refreeze.
pub type AdjustCallback = Box<dyn FnMut(&Pose)>;

/// Receives the new state after a transition.
pub type StateCallback = Box<dyn FnMut(AttachmentState)>;

/// Client notifications for one attachment point. Both are optional.
#[derive(Default)]
pub struct AttachmentCallbacks {
    pub on_adjust: Option<AdjustCallback>,
    pub on_state: Option<StateCallback>,
}

impl AttachmentCallbacks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_adjust(mut self, f: impl FnMut(&Pose) + 'static) -> Self {
        self.on_adjust = Some(Box::new(f));
        self
    }

    pub fn on_state(mut self, f: impl FnMut(AttachmentState) + 'static) -> Self {
        self.on_state = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for AttachmentCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentCallbacks")
            .field("on_adjust", &self.on_adjust.is_some())
            .field("on_state", &self.on_state.is_some())
            .finish()
    }
}

/// Callbacks keyed by attachment point, invoked by iteration over the
/// registry rather than stored on the points themselves.
#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    entries: HashMap<AttachmentId, AttachmentCallbacks>,
}

impl CallbackRegistry {
    pub(crate) fn register(&mut self, id: AttachmentId, callbacks: AttachmentCallbacks) {
        self.entries.insert(id, callbacks);
    }

    pub(crate) fn unregister(&mut self, id: AttachmentId) {
        self.entries.remove(&id);
    }

    pub(crate) fn adjusted(&mut self, id: AttachmentId, delta: &Pose) {
        if let Some(cb) = self.entries.get_mut(&id).and_then(|c| c.on_adjust.as_mut()) {
            cb(delta);
        }
    }

    pub(crate) fn state_changed(&mut self, id: AttachmentId, state: AttachmentState) {
        if let Some(cb) = self.entries.get_mut(&id).and_then(|c| c.on_state.as_mut()) {
            cb(state);
        }
    }
}

/// Arguments for creating an attachment point.
#[derive(Clone, Debug)]
pub struct AttachmentRequest {
    pub name: String,
    /// Locked-space position to track.
    pub position: Vec3,
    /// Existing point whose fragment the new one should join.
    pub context: Option<AttachmentId>,
}

impl AttachmentRequest {
    pub fn new(name: impl Into<String>, position: Vec3) -> Self {
        Self {
            name: name.into(),
            position,
            context: None,
        }
    }

    pub fn with_context(mut self, context: AttachmentId) -> Self {
        self.context = Some(context);
        self
    }
}

/// A client-registered tracked location.
///
/// Holds only its own fragment id; fragment membership lives in the
/// reconciler's per-fragment sets.
#[derive(Clone, Debug)]
pub struct AttachmentPoint {
    pub(crate) id: AttachmentId,
    pub(crate) name: String,
    pub(crate) fragment: FragmentId,
    pub(crate) anchor: AnchorId,
    pub(crate) offset: Vec3,
    pub(crate) position: Vec3,
    pub(crate) state: AttachmentState,
    pub(crate) adjustment: Pose,
    pub(crate) context: Option<AttachmentId>,
}

impl AttachmentPoint {
    pub(crate) fn new(id: AttachmentId, request: AttachmentRequest) -> Self {
        Self {
            id,
            name: request.name,
            fragment: FragmentId::UNKNOWN,
            anchor: AnchorId::UNKNOWN,
            offset: Vec3::ZERO,
            position: request.position,
            state: AttachmentState::Pending,
            adjustment: Pose::IDENTITY,
            context: request.context,
        }
    }

    pub fn id(&self) -> AttachmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fragment(&self) -> FragmentId {
        self.fragment
    }

    pub fn anchor(&self) -> AnchorId {
        self.anchor
    }

    pub fn offset(&self) -> Vec3 {
        self.offset
    }

    /// Last known locked-space position.
    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    /// Product of every adjustment applied since creation, newest leftmost.
    pub fn cumulative_adjustment(&self) -> Pose {
        self.adjustment
    }

    /// Anchor binding, once the point has been bound.
    pub fn binding(&self) -> Option<AnchorBinding> {
        self.anchor.is_known().then_some(AnchorBinding {
            fragment: self.fragment,
            anchor: self.anchor,
            offset: self.offset,
        })
    }

    pub(crate) fn bind(&mut self, binding: AnchorBinding, position: Vec3) {
        self.fragment = binding.fragment;
        self.anchor = binding.anchor;
        self.offset = binding.offset;
        self.position = position;
    }

    /// Apply a pose delta to the cached position and record it.
    pub(crate) fn apply_adjustment(&mut self, delta: Pose) {
        self.position = delta.transform_point(self.position);
        self.adjustment = delta * self.adjustment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quaternion::Quaternion;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_new_point_is_pending_and_unbound() {
        let p = AttachmentPoint::new(AttachmentId(1), AttachmentRequest::new("door", Vec3::ZERO));
        assert_eq!(p.state(), AttachmentState::Pending);
        assert!(p.binding().is_none());
        assert_eq!(p.name(), "door");
    }

    #[test]
    fn test_adjustment_accumulates() {
        let mut p = AttachmentPoint::new(
            AttachmentId(1),
            AttachmentRequest::new("p", Vec3::new(1.0, 0.0, 0.0)),
        );
        let shift = Pose::from_position(Vec3::new(0.0, 0.0, 2.0));
        let turn = Pose::new(Vec3::ZERO, Quaternion::from_yaw(0.5));
        p.apply_adjustment(shift);
        p.apply_adjustment(turn);
        let expected = (turn * shift).transform_point(Vec3::new(1.0, 0.0, 0.0));
        assert!(p.position().distance(expected) < 1e-12);
        assert!(p.cumulative_adjustment().approx_eq(turn * shift, 1e-12));
    }

    #[test]
    fn test_registry_routes_by_id() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut registry = CallbackRegistry::default();
        registry.register(
            AttachmentId(7),
            AttachmentCallbacks::none().on_state(move |s| sink.borrow_mut().push(s)),
        );
        registry.state_changed(AttachmentId(7), AttachmentState::Normal);
        registry.state_changed(AttachmentId(8), AttachmentState::Normal);
        registry.unregister(AttachmentId(7));
        registry.state_changed(AttachmentId(7), AttachmentState::Released);
        assert_eq!(*seen.borrow(), vec![AttachmentState::Normal]);
    }
}
