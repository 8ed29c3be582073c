//! Pin-based alignment of locked space to virtual space.
//!
//! Each pin says "this locked pose should appear at that virtual pose".
//! Every tick the pins of the current fragment are triangulated on the
//! horizontal plane and the device's locked position picks up to three of
//! them; their individual corrections are folded into one pose with the
//! pairwise weighted blend.
//!
//! Pins are staged first. `send_alignment_anchors` only marks the staged
//! set for commit; the swap into the active set happens at the start of
//! the next `compute_pinned_pose`, once every caller has finished staging
//! for the tick.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attachment::{AttachmentCallbacks, AttachmentRequest};
use crate::fragment::{FragmentReconciler, RefitEvent};
use crate::ids::{AnchorId, AttachmentId, FragmentId, IdSequence, PinId};
use crate::optimizer::Optimizer;
use crate::pose::{Pose, WeightedPose};
use crate::triangulate::{Bounds2, Triangulator};

/// Mutable view of the components a blender needs to create and release
/// the attachment points backing its pins.
pub struct AlignmentContext<'a> {
    pub fragments: &'a mut FragmentReconciler,
    pub optimizer: &'a dyn Optimizer,
}

/// How a pin's correspondence turns into a correction pose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlignmentMode {
    /// Process-wide alignment: `virtual = Z * locked`.
    Global,
    /// Application-owned sub-alignment solved relative to a parent frame.
    Independent { parent: Pose },
}

/// A named virtual/locked correspondence.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferencePose {
    pub id: PinId,
    pub name: String,
    pub virtual_pose: Pose,
    /// Locked pose, kept current across merges and refreezes.
    pub locked_pose: Pose,
    pub fragment: FragmentId,
    pub anchor: AnchorId,
    pub attachment: AttachmentId,
    /// Cumulative attachment adjustment already folded into `locked_pose`.
    applied: Pose,
}

impl ReferencePose {
    /// Correction this pin alone would apply.
    pub fn correction(&self, mode: AlignmentMode) -> Pose {
        match mode {
            AlignmentMode::Global => self.virtual_pose * self.locked_pose.inverse(),
            AlignmentMode::Independent { parent } => {
                parent.inverse() * self.locked_pose * self.virtual_pose.inverse()
            }
        }
    }
}

/// Persisted form of a pin: only the name and both poses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub name: String,
    pub virtual_pose: Pose,
    pub locked_pose: Pose,
}

pub type RebuiltCallback = Box<dyn FnMut(&Triangulator)>;
pub type RestoredCallback = Box<dyn FnMut(&[String])>;

pub struct AlignmentBlender {
    mode: AlignmentMode,
    pin_ids: IdSequence,
    staged: Vec<ReferencePose>,
    active: Vec<ReferencePose>,
    commit_requested: bool,
    /// Attachments of pins dropped by a commit, released on the next call
    /// that can reach the reconciler mutably.
    retired: Vec<AttachmentId>,
    triangulator: Triangulator,
    /// Index into `active` for each real triangulation vertex.
    vertex_pins: Vec<usize>,
    triangulated_fragment: FragmentId,
    needs_rebuild: bool,
    pinned_from_locked: Pose,
    saved: BTreeMap<String, PinRecord>,
    rebuilt_subscribers: Vec<RebuiltCallback>,
    restored_subscribers: Vec<RestoredCallback>,
}

impl fmt::Debug for AlignmentBlender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignmentBlender")
            .field("mode", &self.mode)
            .field("staged", &self.staged.len())
            .field("active", &self.active.len())
            .field("pinned_from_locked", &self.pinned_from_locked)
            .finish()
    }
}

impl AlignmentBlender {
    /// `extent` is the half-size of the square (x, z) domain pins may occupy.
    pub fn new(mode: AlignmentMode, extent: f64) -> Self {
        Self {
            mode,
            pin_ids: IdSequence::default(),
            staged: Vec::new(),
            active: Vec::new(),
            commit_requested: false,
            retired: Vec::new(),
            triangulator: Triangulator::new(Bounds2::square(extent)),
            vertex_pins: Vec::new(),
            triangulated_fragment: FragmentId::UNKNOWN,
            needs_rebuild: false,
            pinned_from_locked: Pose::IDENTITY,
            saved: BTreeMap::new(),
            rebuilt_subscribers: Vec::new(),
            restored_subscribers: Vec::new(),
        }
    }

    pub fn mode(&self) -> AlignmentMode {
        self.mode
    }

    pub fn set_parent(&mut self, parent: Pose) {
        if let AlignmentMode::Independent { parent: p } = &mut self.mode {
            *p = parent;
        }
    }

    /// Correction from the last compute pass.
    pub fn pinned_from_locked(&self) -> Pose {
        self.pinned_from_locked
    }

    pub fn active_pins(&self) -> &[ReferencePose] {
        &self.active
    }

    pub fn staged_pins(&self) -> &[ReferencePose] {
        &self.staged
    }

    pub fn triangulator(&self) -> &Triangulator {
        &self.triangulator
    }

    /// Names available for `restore_alignment_anchor` after a load.
    pub fn saved_names(&self) -> impl Iterator<Item = &str> {
        self.saved.keys().map(String::as_str)
    }

    pub fn subscribe_rebuilt(&mut self, f: impl FnMut(&Triangulator) + 'static) {
        self.rebuilt_subscribers.push(Box::new(f));
    }

    /// Called after `load_record` with the names that can be restored.
    pub fn subscribe_restored(&mut self, f: impl FnMut(&[String]) + 'static) {
        self.restored_subscribers.push(Box::new(f));
    }

    /// Stage a pin in the current fragment. A pin with the same name is
    /// replaced. Returns `PinId::UNKNOWN` without a current fragment.
    pub fn add_alignment_anchor(
        &mut self,
        ctx: &mut AlignmentContext<'_>,
        name: &str,
        virtual_pose: Pose,
        locked_pose: Pose,
    ) -> PinId {
        let fragment = ctx.fragments.current_fragment();
        if !fragment.is_known() {
            warn!(pin = name, "no current fragment, alignment anchor not added");
            return PinId::UNKNOWN;
        }
        if !virtual_pose.is_finite() || !locked_pose.is_finite() {
            warn!(pin = name, "non-finite alignment anchor pose rejected");
            return PinId::UNKNOWN;
        }
        self.release_retired(ctx.fragments);
        if let Some(pos) = self.staged.iter().position(|p| p.name == name) {
            let old = self.staged.remove(pos);
            release_unshared(&self.active, ctx.fragments, old.attachment);
        }

        let attachment = ctx.fragments.create_attachment_point(
            ctx.optimizer,
            AttachmentRequest::new(name, locked_pose.position),
            AttachmentCallbacks::none(),
        );
        let (anchor, applied) = ctx
            .fragments
            .attachment(attachment)
            .map(|p| (p.anchor(), p.cumulative_adjustment()))
            .unwrap_or((AnchorId::UNKNOWN, Pose::IDENTITY));

        let id = PinId(self.pin_ids.next_raw());
        debug!(pin = %id, name, fragment = %fragment, "alignment anchor staged");
        self.staged.push(ReferencePose {
            id,
            name: name.to_string(),
            virtual_pose,
            locked_pose,
            fragment,
            anchor,
            attachment,
            applied,
        });
        id
    }

    /// Unstage a pin. False if the id is not staged.
    pub fn remove_alignment_anchor(
        &mut self,
        fragments: &mut FragmentReconciler,
        id: PinId,
    ) -> bool {
        let Some(pos) = self.staged.iter().position(|p| p.id == id) else {
            return false;
        };
        let pin = self.staged.remove(pos);
        release_unshared(&self.active, fragments, pin.attachment);
        self.release_retired(fragments);
        true
    }

    /// Unstage every pin.
    pub fn clear_alignment_anchors(&mut self, fragments: &mut FragmentReconciler) {
        for pin in self.staged.drain(..) {
            release_unshared(&self.active, fragments, pin.attachment);
        }
        self.release_retired(fragments);
    }

    /// Commit the staged set at the start of the next compute pass.
    pub fn send_alignment_anchors(&mut self) {
        self.commit_requested = true;
    }

    /// Stored locked pose of a staged or active pin.
    pub fn get_alignment_pose(&self, id: PinId) -> Option<Pose> {
        self.staged
            .iter()
            .chain(self.active.iter())
            .find(|p| p.id == id)
            .map(|p| p.locked_pose)
    }

    /// Fold refit adjustments into the pins and schedule a rebuild.
    pub fn handle_refit(&mut self, fragments: &FragmentReconciler, event: &RefitEvent) {
        debug!(target = %event.target, "alignment refit");
        self.sync_pins(fragments);
        self.needs_rebuild = true;
    }

    /// Blend the current fragment's pins at the device's locked position.
    /// Identity when no pin applies.
    pub fn compute_pinned_pose(
        &mut self,
        fragments: &FragmentReconciler,
        locked_head: Pose,
    ) -> Pose {
        if self.commit_requested {
            self.commit_requested = false;
            for old in &self.active {
                if !self.staged.iter().any(|p| p.attachment == old.attachment) {
                    self.retired.push(old.attachment);
                }
            }
            self.active = self.staged.clone();
            self.needs_rebuild = true;
            info!(pins = self.active.len(), "alignment anchors committed");
        }
        self.sync_pins(fragments);

        let current = fragments.current_fragment();
        if current != self.triangulated_fragment {
            self.needs_rebuild = true;
        }
        if self.needs_rebuild {
            self.rebuild(current);
        }

        self.pinned_from_locked = self.blend(locked_head).unwrap_or(Pose::IDENTITY);
        self.pinned_from_locked
    }

    /// Snapshot of the staged pins for persistence.
    pub fn save_record(&self) -> Vec<PinRecord> {
        self.staged
            .iter()
            .map(|p| PinRecord {
                name: p.name.clone(),
                virtual_pose: p.virtual_pose,
                locked_pose: p.locked_pose,
            })
            .collect()
    }

    /// Remember loaded pins for later restore. Nothing is staged here.
    pub fn load_record(&mut self, records: Vec<PinRecord>) {
        self.saved = records.into_iter().map(|r| (r.name.clone(), r)).collect();
        let names: Vec<String> = self.saved.keys().cloned().collect();
        info!(pins = names.len(), "alignment record loaded");
        for subscriber in &mut self.restored_subscribers {
            subscriber(&names);
        }
    }

    /// Re-stage a loaded pin by name. The virtual pose must match the
    /// stored one exactly.
    pub fn restore_alignment_anchor(
        &mut self,
        ctx: &mut AlignmentContext<'_>,
        name: &str,
        virtual_pose: Pose,
    ) -> PinId {
        let Some(record) = self.saved.get(name) else {
            warn!(pin = name, "no saved alignment anchor with this name");
            return PinId::UNKNOWN;
        };
        if !record.virtual_pose.bitwise_eq(virtual_pose) {
            warn!(pin = name, "virtual pose differs from saved record, not restored");
            return PinId::UNKNOWN;
        }
        let locked = record.locked_pose;
        self.add_alignment_anchor(ctx, name, virtual_pose, locked)
    }

    /// Drop every pin, staged and active, and any loaded record.
    pub fn reset(&mut self, fragments: &mut FragmentReconciler) {
        self.clear_alignment_anchors(fragments);
        for pin in self.active.drain(..) {
            fragments.release_attachment_point(pin.attachment);
        }
        self.saved.clear();
        self.commit_requested = false;
        self.pinned_from_locked = Pose::IDENTITY;
        self.triangulated_fragment = FragmentId::UNKNOWN;
        self.triangulator.clear();
        self.vertex_pins.clear();
        self.needs_rebuild = false;
    }

    fn release_retired(&mut self, fragments: &mut FragmentReconciler) {
        for id in self.retired.drain(..) {
            fragments.release_attachment_point(id);
        }
    }

    fn sync_pins(&mut self, fragments: &FragmentReconciler) {
        for pin in self.staged.iter_mut().chain(self.active.iter_mut()) {
            let Some(point) = fragments.attachment(pin.attachment) else {
                continue;
            };
            let cumulative = point.cumulative_adjustment();
            if !cumulative.bitwise_eq(pin.applied) {
                let delta = cumulative * pin.applied.inverse();
                pin.locked_pose = delta * pin.locked_pose;
                pin.applied = cumulative;
                self.needs_rebuild = true;
            }
            if point.fragment().is_known() && point.fragment() != pin.fragment {
                pin.fragment = point.fragment();
                pin.anchor = point.anchor();
                self.needs_rebuild = true;
            }
        }
    }

    fn rebuild(&mut self, current: FragmentId) {
        self.needs_rebuild = false;
        self.triangulated_fragment = current;
        self.triangulator.clear();
        self.vertex_pins.clear();

        let candidates: Vec<usize> = self
            .active
            .iter()
            .enumerate()
            .filter(|(_, p)| current.is_known() && p.fragment == current)
            .map(|(i, _)| i)
            .collect();
        let points: Vec<_> = candidates
            .iter()
            .map(|&i| self.active[i].locked_pose.position.horizontal())
            .collect();
        let assigned = self.triangulator.add_points(&points);
        for (slot, pin) in assigned.into_iter().zip(candidates) {
            if slot.is_some() {
                self.vertex_pins.push(pin);
            } else {
                warn!(pin = %self.active[pin].id, "pin left out of triangulation");
            }
        }

        debug!(
            fragment = %current,
            vertices = self.vertex_pins.len(),
            "triangulation rebuilt"
        );
        for subscriber in &mut self.rebuilt_subscribers {
            subscriber(&self.triangulator);
        }
    }

    fn blend(&self, locked_head: Pose) -> Option<Pose> {
        let hit = self.triangulator.find(locked_head.position.horizontal())?;
        let weighted: Vec<WeightedPose> = hit
            .idx
            .iter()
            .zip(hit.weights)
            .map(|(&v, w)| {
                let pin = &self.active[*self.vertex_pins.get(v)?];
                Some(WeightedPose::new(pin.correction(self.mode), w))
            })
            .collect::<Option<_>>()?;
        weighted
            .into_iter()
            .reduce(WeightedPose::combine)
            .map(|w| w.pose)
    }
}

/// Staged and active pins share an attachment until the next commit
/// replaces the active one.
fn release_unshared(
    active: &[ReferencePose],
    fragments: &mut FragmentReconciler,
    attachment: AttachmentId,
) {
    if !active.iter().any(|p| p.attachment == attachment) {
        fragments.release_attachment_point(attachment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentOptimizer;
    use crate::optimizer::AnchorPose;
    use crate::quaternion::Quaternion;
    use crate::settings::FragmentSettings;
    use crate::vector::Vec3;
    use std::cell::Cell;
    use std::rc::Rc;

    fn world() -> (ComponentOptimizer, FragmentReconciler) {
        let mut opt = ComponentOptimizer::new();
        opt.submit_graph(
            &[AnchorPose {
                id: AnchorId(1),
                pose: Pose::IDENTITY,
            }],
            &[],
            AnchorId(1),
        )
        .unwrap();
        let mut rec = FragmentReconciler::new(FragmentSettings::default());
        rec.update(&mut opt, true, true);
        (opt, rec)
    }

    fn at(x: f64, y: f64, z: f64) -> Pose {
        Pose::from_position(Vec3::new(x, y, z))
    }

    fn two_pins(
        blender: &mut AlignmentBlender,
        opt: &ComponentOptimizer,
        rec: &mut FragmentReconciler,
    ) -> (PinId, PinId) {
        let mut ctx = AlignmentContext {
            fragments: rec,
            optimizer: opt,
        };
        let p1 = blender.add_alignment_anchor(&mut ctx, "p1", at(0.0, 0.0, 0.0), at(0.0, 0.0, 0.0));
        let p2 = blender.add_alignment_anchor(&mut ctx, "p2", at(1.0, 0.0, 0.0), at(1.0, 0.0, 0.1));
        (p1, p2)
    }

    #[test]
    fn test_two_pins_blend_evenly() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let (p1, p2) = two_pins(&mut blender, &opt, &mut rec);
        assert!(p1.is_known() && p2.is_known());

        blender.send_alignment_anchors();
        let pose = blender.compute_pinned_pose(&rec, at(0.5, 0.0, 0.05));
        assert!(pose.approx_eq(at(0.0, 0.0, -0.05), 1e-9));
        assert_eq!(blender.active_pins().len(), 2);
    }

    #[test]
    fn test_staged_pins_wait_for_send() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        blender.add_alignment_anchor(&mut ctx, "p", at(0.0, 0.0, 1.0), at(0.0, 0.0, 0.0));
        assert_eq!(blender.compute_pinned_pose(&rec, Pose::IDENTITY), Pose::IDENTITY);

        blender.send_alignment_anchors();
        let pose = blender.compute_pinned_pose(&rec, Pose::IDENTITY);
        assert!(pose.approx_eq(at(0.0, 0.0, 1.0), 1e-12));
    }

    #[test]
    fn test_no_current_fragment_rejects_pin() {
        let opt = ComponentOptimizer::new();
        let mut rec = FragmentReconciler::new(FragmentSettings::default());
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        let id = blender.add_alignment_anchor(&mut ctx, "p", Pose::IDENTITY, Pose::IDENTITY);
        assert_eq!(id, PinId::UNKNOWN);
    }

    #[test]
    fn test_compute_is_bit_identical() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        two_pins(&mut blender, &opt, &mut rec);
        blender.send_alignment_anchors();
        let head = Pose::new(Vec3::new(0.3, 1.6, 0.2), Quaternion::from_yaw(0.7));
        let a = blender.compute_pinned_pose(&rec, head);
        let b = blender.compute_pinned_pose(&rec, head);
        assert!(a.bitwise_eq(b));
    }

    #[test]
    fn test_remove_and_clear() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let (p1, _p2) = two_pins(&mut blender, &opt, &mut rec);
        assert_eq!(rec.attachments().count(), 2);

        assert!(blender.remove_alignment_anchor(&mut rec, p1));
        assert!(!blender.remove_alignment_anchor(&mut rec, p1));
        assert!(!blender.remove_alignment_anchor(&mut rec, PinId(77)));
        assert_eq!(rec.attachments().count(), 1);
        assert!(blender.get_alignment_pose(p1).is_none());

        blender.clear_alignment_anchors(&mut rec);
        assert!(blender.staged_pins().is_empty());
        assert_eq!(rec.attachments().count(), 0);
    }

    #[test]
    fn test_same_name_replaces_pin() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        blender.add_alignment_anchor(&mut ctx, "door", Pose::IDENTITY, Pose::IDENTITY);
        let second = blender.add_alignment_anchor(&mut ctx, "door", at(1.0, 0.0, 0.0), at(2.0, 0.0, 0.0));
        assert_eq!(blender.staged_pins().len(), 1);
        assert_eq!(blender.get_alignment_pose(second), Some(at(2.0, 0.0, 0.0)));
        assert_eq!(rec.attachments().count(), 1);
    }

    #[test]
    fn test_restaging_keeps_active_attachment() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        blender.add_alignment_anchor(&mut ctx, "door", at(0.0, 0.0, 1.0), Pose::IDENTITY);
        blender.send_alignment_anchors();
        blender.compute_pinned_pose(&rec, Pose::IDENTITY);
        let committed = blender.active_pins()[0].attachment;

        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        blender.add_alignment_anchor(&mut ctx, "door", at(0.0, 0.0, 2.0), Pose::IDENTITY);
        assert!(rec.attachment(committed).is_some());
        assert_eq!(rec.attachments().count(), 2);

        blender.send_alignment_anchors();
        blender.compute_pinned_pose(&rec, Pose::IDENTITY);
        let replacement = blender.active_pins()[0].attachment;
        assert_ne!(replacement, committed);

        blender.clear_alignment_anchors(&mut rec);
        assert!(rec.attachment(committed).is_none());
        assert!(rec.attachment(replacement).is_some());

        blender.reset(&mut rec);
        assert_eq!(rec.attachments().count(), 0);
    }

    #[test]
    fn test_restore_requires_exact_virtual_pose() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        two_pins(&mut blender, &opt, &mut rec);
        let record = blender.save_record();
        assert_eq!(record.len(), 2);

        let mut fresh = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let notified = Rc::new(Cell::new(0));
        let seen = Rc::clone(&notified);
        fresh.subscribe_restored(move |names| seen.set(names.len()));
        fresh.load_record(record);
        assert_eq!(notified.get(), 2);
        assert!(fresh.staged_pins().is_empty());

        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        let wrong = fresh.restore_alignment_anchor(&mut ctx, "p2", at(1.0, 0.0, 0.0001));
        assert_eq!(wrong, PinId::UNKNOWN);
        let missing = fresh.restore_alignment_anchor(&mut ctx, "nope", Pose::IDENTITY);
        assert_eq!(missing, PinId::UNKNOWN);
        let ok = fresh.restore_alignment_anchor(&mut ctx, "p2", at(1.0, 0.0, 0.0));
        assert!(ok.is_known());
        assert_eq!(fresh.get_alignment_pose(ok), Some(at(1.0, 0.0, 0.1)));
    }

    #[test]
    fn test_rebuilt_fires_on_commit() {
        let (opt, mut rec) = world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        let rebuilt = Rc::new(Cell::new(0usize));
        let seen = Rc::clone(&rebuilt);
        blender.subscribe_rebuilt(move |tri| seen.set(tri.real_count()));
        two_pins(&mut blender, &opt, &mut rec);
        blender.send_alignment_anchors();
        blender.compute_pinned_pose(&rec, Pose::IDENTITY);
        assert_eq!(rebuilt.get(), 2);
    }

    #[test]
    fn test_independent_mode_uses_parent_frame() {
        let (opt, mut rec) = world();
        let parent = at(0.0, 0.0, 5.0);
        let mut blender = AlignmentBlender::new(AlignmentMode::Independent { parent }, 1000.0);
        let mut ctx = AlignmentContext {
            fragments: &mut rec,
            optimizer: &opt,
        };
        let virt = at(1.0, 0.0, 0.0);
        let locked = at(0.0, 0.0, 2.0);
        blender.add_alignment_anchor(&mut ctx, "p", virt, locked);
        blender.send_alignment_anchors();
        let pose = blender.compute_pinned_pose(&rec, Pose::IDENTITY);
        let expected = parent.inverse() * locked * virt.inverse();
        assert!(pose.approx_eq(expected, 1e-12));
        assert!(pose.approx_eq(at(-1.0, 0.0, -3.0), 1e-12));
    }
}
