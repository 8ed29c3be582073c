//! Fragment bookkeeping and attachment point lifecycle.
//!
//! Fragments hold sets of attachment point ids; a point only knows the id
//! of the fragment it belongs to. Points that cannot be bound yet (no
//! current fragment, or their context point is itself unbound) wait in a
//! FIFO queue and are resolved in creation order on later ticks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attachment::{
    AttachmentCallbacks, AttachmentPoint, AttachmentRequest, AttachmentState, CallbackRegistry,
};
use crate::ids::{AnchorId, AttachmentId, FragmentId, IdSequence};
use crate::optimizer::{AnchorBinding, Optimizer};
use crate::settings::FragmentSettings;
use crate::vector::Vec3;

#[derive(Clone, Debug)]
pub struct Fragment {
    id: FragmentId,
    state: AttachmentState,
    points: BTreeSet<AttachmentId>,
}

impl Fragment {
    fn new(id: FragmentId) -> Self {
        Self {
            id,
            state: AttachmentState::Unconnected,
            points: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    pub fn points(&self) -> impl Iterator<Item = AttachmentId> + '_ {
        self.points.iter().copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefitKind {
    Merge,
    Refreeze,
}

/// A completed merge or refreeze.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RefitEvent {
    pub kind: RefitKind,
    pub target: FragmentId,
    /// Fragments folded into `target` and no longer tracked.
    pub absorbed: Vec<FragmentId>,
}

pub type RefitCallback = Box<dyn FnMut(&RefitEvent)>;

pub struct FragmentReconciler {
    settings: FragmentSettings,
    fragments: BTreeMap<FragmentId, Fragment>,
    points: BTreeMap<AttachmentId, AttachmentPoint>,
    callbacks: CallbackRegistry,
    pending: VecDeque<AttachmentId>,
    current: FragmentId,
    ids: IdSequence,
    /// Points moved between fragments since the last broadcast. They get a
    /// state notification even when the value did not change.
    transferred: BTreeSet<AttachmentId>,
    refit_subscribers: Vec<RefitCallback>,
}

impl fmt::Debug for FragmentReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentReconciler")
            .field("current", &self.current)
            .field("fragments", &self.fragments.len())
            .field("points", &self.points.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl FragmentReconciler {
    pub fn new(settings: FragmentSettings) -> Self {
        Self {
            settings,
            fragments: BTreeMap::new(),
            points: BTreeMap::new(),
            callbacks: CallbackRegistry::default(),
            pending: VecDeque::new(),
            current: FragmentId::UNKNOWN,
            ids: IdSequence::default(),
            transferred: BTreeSet::new(),
            refit_subscribers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &FragmentSettings {
        &self.settings
    }

    pub fn current_fragment(&self) -> FragmentId {
        self.current
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<&AttachmentPoint> {
        self.points.get(&id)
    }

    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentPoint> {
        self.points.values()
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        self.fragments.get(&id)
    }

    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        self.fragments.keys().copied().collect()
    }

    /// Last broadcast state of a fragment; `None` if it is not tracked.
    pub fn fragment_state(&self, id: FragmentId) -> Option<AttachmentState> {
        self.fragments.get(&id).map(|f| f.state)
    }

    pub fn points_in(&self, fragment: FragmentId) -> Vec<AttachmentId> {
        self.fragments
            .get(&fragment)
            .map(|f| f.points.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register for merge/refreeze notifications. Subscribers run after the
    /// reconciler has finished all bookkeeping for the event.
    pub fn subscribe_refit(&mut self, f: impl FnMut(&RefitEvent) + 'static) {
        self.refit_subscribers.push(Box::new(f));
    }

    /// Create a point and bind it now if possible, otherwise queue it.
    pub fn create_attachment_point(
        &mut self,
        optimizer: &dyn Optimizer,
        mut request: AttachmentRequest,
        callbacks: AttachmentCallbacks,
    ) -> AttachmentId {
        if let Some(ctx) = request.context
            && !self.points.contains_key(&ctx)
        {
            debug!(context = %ctx, "ignoring unknown context point");
            request.context = None;
        }
        let id = AttachmentId(self.ids.next_raw());
        self.points.insert(id, AttachmentPoint::new(id, request));
        self.callbacks.register(id, callbacks);
        if !self.try_bind(optimizer, id) {
            debug!(point = %id, "attachment point queued");
            self.pending.push_back(id);
        }
        id
    }

    /// Release a point. Fires `Released` and forgets its callbacks.
    /// Returns false for unknown ids.
    pub fn release_attachment_point(&mut self, id: AttachmentId) -> bool {
        let Some(point) = self.points.remove(&id) else {
            return false;
        };
        if let Some(fragment) = self.fragments.get_mut(&point.fragment) {
            fragment.points.remove(&id);
        }
        self.pending.retain(|&p| p != id);
        self.transferred.remove(&id);
        for other in self.points.values_mut() {
            if other.context == Some(id) {
                other.context = None;
            }
        }
        self.callbacks.state_changed(id, AttachmentState::Released);
        self.callbacks.unregister(id);
        true
    }

    /// Move a point within its fragment. Moves under `min_move_distance`
    /// are ignored.
    pub fn move_attachment_point(
        &mut self,
        optimizer: &dyn Optimizer,
        id: AttachmentId,
        position: Vec3,
    ) -> bool {
        let Some(point) = self.points.get_mut(&id) else {
            return false;
        };
        if !position.is_finite() {
            return false;
        }
        let Some(binding) = point.binding() else {
            point.position = position;
            return true;
        };
        if point.position.distance(position) < self.settings.min_move_distance {
            return true;
        }
        self.rebind(optimizer, id, position, Some(binding));
        true
    }

    /// Move a point anywhere, possibly into another fragment.
    pub fn teleport_attachment_point(
        &mut self,
        optimizer: &dyn Optimizer,
        id: AttachmentId,
        position: Vec3,
    ) -> bool {
        let Some(point) = self.points.get_mut(&id) else {
            return false;
        };
        if !position.is_finite() {
            return false;
        }
        if point.binding().is_none() {
            point.position = position;
            return true;
        }
        self.rebind(optimizer, id, position, None);
        self.broadcast();
        true
    }

    /// Ask the optimizer to merge and fold the source fragments' points
    /// into the target.
    pub fn merge(&mut self, optimizer: &mut dyn Optimizer) -> Option<RefitEvent> {
        let result = optimizer.merge()?;
        if !result.target.is_known() {
            warn!("optimizer merged into an unknown fragment, ignoring");
            return None;
        }
        let target = result.target;
        self.fragment_entry(target);

        let mut absorbed = Vec::new();
        for source in result.sources.iter().filter(|s| s.fragment != target) {
            absorbed.push(source.fragment);
            let Some(fragment) = self.fragments.remove(&source.fragment) else {
                continue;
            };
            for id in fragment.points {
                if let Some(point) = self.points.get_mut(&id) {
                    point.apply_adjustment(source.adjustment);
                    point.offset = source.adjustment.rotation.rotate(point.offset);
                    point.fragment = target;
                }
                self.fragment_entry(target).points.insert(id);
                self.transferred.insert(id);
                self.callbacks.adjusted(id, &source.adjustment);
            }
        }
        if absorbed.contains(&self.current) {
            self.current = target;
        }

        info!(target = %target, absorbed = absorbed.len(), "merged fragments");
        self.broadcast();
        let event = RefitEvent {
            kind: RefitKind::Merge,
            target,
            absorbed,
        };
        self.notify_refit(&event);
        Some(event)
    }

    /// Ask the optimizer to refreeze and re-place every point of the
    /// target and absorbed fragments.
    pub fn refreeze(&mut self, optimizer: &mut dyn Optimizer) -> Option<RefitEvent> {
        let result = optimizer.refreeze()?;
        if !result.target.is_known() {
            warn!("optimizer refroze an unknown fragment, ignoring");
            return None;
        }
        let target = result.target;
        let absorbed: Vec<FragmentId> = result
            .absorbed
            .into_iter()
            .filter(|f| *f != target)
            .collect();

        let mut affected: Vec<AttachmentId> = self.fragment_entry(target).points().collect();
        for f in &absorbed {
            if let Some(fragment) = self.fragments.remove(f) {
                self.transferred.extend(fragment.points.iter().copied());
                affected.extend(fragment.points);
            }
        }

        for id in affected {
            let Some(binding) = self.points.get(&id).and_then(|p| p.binding()) else {
                continue;
            };
            let adjustment = optimizer.adjust_attachment(&binding);
            if let Some(point) = self.points.get_mut(&id) {
                if let Some(adj) = adjustment {
                    point.apply_adjustment(adj.adjustment);
                    point.anchor = adj.binding.anchor;
                    point.offset = adj.binding.offset;
                }
                point.fragment = target;
            }
            self.fragment_entry(target).points.insert(id);
            if let Some(adj) = adjustment {
                self.callbacks.adjusted(id, &adj.adjustment);
            }
        }
        if absorbed.contains(&self.current) {
            self.current = target;
        }

        info!(target = %target, absorbed = absorbed.len(), "refroze fragment");
        self.broadcast();
        let event = RefitEvent {
            kind: RefitKind::Refreeze,
            target,
            absorbed,
        };
        self.notify_refit(&event);
        Some(event)
    }

    /// Tracking lost: no fragment is current, every point goes unconnected.
    pub fn pause(&mut self) {
        if self.current.is_known() {
            info!(fragment = %self.current, "fragments paused");
        }
        self.current = FragmentId::UNKNOWN;
        self.broadcast();
    }

    /// Per-tick reconciliation. Refreeze wins over merge when both are
    /// indicated. Returns the refits that happened.
    pub fn update(
        &mut self,
        optimizer: &mut dyn Optimizer,
        auto_refreeze: bool,
        auto_merge: bool,
    ) -> Vec<RefitEvent> {
        self.current = optimizer.current_fragment();
        let mut refits = Vec::new();
        if self.current.is_known() {
            self.fragment_entry(self.current);
            if auto_refreeze && optimizer.refreeze_indicated() {
                refits.extend(self.refreeze(optimizer));
            } else if auto_merge && optimizer.merge_indicated() {
                refits.extend(self.merge(optimizer));
            }
            let after = optimizer.current_fragment();
            if after.is_known() {
                self.current = after;
            }
        }
        self.broadcast();
        self.flush_pending(optimizer);
        refits
    }

    /// Unbind every point and drop all fragments. Points are re-queued and
    /// bind again once a fragment becomes current.
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.transferred.clear();
        self.current = FragmentId::UNKNOWN;
        let ids: Vec<AttachmentId> = self.points.keys().copied().collect();
        for id in ids {
            if let Some(point) = self.points.get_mut(&id)
                && point.anchor.is_known()
            {
                point.fragment = FragmentId::UNKNOWN;
                point.anchor = AnchorId::UNKNOWN;
                point.offset = Vec3::ZERO;
                self.pending.push_back(id);
                self.set_state(id, AttachmentState::Unconnected, false);
            }
        }
    }

    fn fragment_entry(&mut self, id: FragmentId) -> &mut Fragment {
        self.fragments
            .entry(id)
            .or_insert_with(|| Fragment::new(id))
    }

    fn state_for(&self, fragment: FragmentId) -> AttachmentState {
        if fragment.is_known() && fragment == self.current {
            AttachmentState::Normal
        } else {
            AttachmentState::Unconnected
        }
    }

    fn set_state(&mut self, id: AttachmentId, state: AttachmentState, force: bool) {
        let Some(point) = self.points.get_mut(&id) else {
            return;
        };
        if point.state == state && !force {
            return;
        }
        point.state = state;
        self.callbacks.state_changed(id, state);
    }

    /// Bind a queued point. False if it has to keep waiting.
    fn try_bind(&mut self, optimizer: &dyn Optimizer, id: AttachmentId) -> bool {
        let Some(point) = self.points.get(&id) else {
            return false;
        };
        let position = point.position;
        let context = match point.context.and_then(|c| self.points.get(&c)) {
            Some(ctx) => match ctx.binding() {
                Some(b) => Some(b),
                None => return false,
            },
            None => None,
        };
        if context.is_none() && !self.current.is_known() {
            return false;
        }
        let Some(binding) = optimizer.bind_attachment(position, context.as_ref()) else {
            return false;
        };
        if !binding.fragment.is_known() {
            return false;
        }
        if let Some(point) = self.points.get_mut(&id) {
            point.bind(binding, position);
            point.context = None;
        }
        self.fragment_entry(binding.fragment).points.insert(id);
        let state = self.state_for(binding.fragment);
        self.set_state(id, state, false);
        true
    }

    fn rebind(
        &mut self,
        optimizer: &dyn Optimizer,
        id: AttachmentId,
        position: Vec3,
        context: Option<AnchorBinding>,
    ) {
        let Some(old) = self.points.get(&id).map(|p| p.fragment) else {
            return;
        };
        let binding = optimizer
            .bind_attachment(position, context.as_ref())
            .filter(|b| b.fragment.is_known());
        let Some(point) = self.points.get_mut(&id) else {
            return;
        };
        let Some(binding) = binding else {
            point.position = position;
            return;
        };
        point.bind(binding, position);
        if binding.fragment != old {
            if let Some(f) = self.fragments.get_mut(&old) {
                f.points.remove(&id);
            }
            self.fragment_entry(binding.fragment).points.insert(id);
            self.transferred.insert(id);
            debug!(point = %id, from = %old, to = %binding.fragment, "point changed fragment");
        }
    }

    /// Push every fragment's connectivity state to its points.
    fn broadcast(&mut self) {
        let mut changes = Vec::new();
        for fragment in self.fragments.values_mut() {
            let state = if fragment.id.is_known() && fragment.id == self.current {
                AttachmentState::Normal
            } else {
                AttachmentState::Unconnected
            };
            fragment.state = state;
            changes.extend(fragment.points.iter().map(|&id| (id, state)));
        }
        for (id, state) in changes {
            let force = self.transferred.remove(&id);
            self.set_state(id, state, force);
        }
        self.transferred.clear();
    }

    fn flush_pending(&mut self, optimizer: &dyn Optimizer) {
        if self.pending.is_empty() {
            return;
        }
        let queued: Vec<AttachmentId> = self.pending.drain(..).collect();
        let before = queued.len();
        for id in queued {
            if !self.try_bind(optimizer, id) {
                self.pending.push_back(id);
            }
        }
        let bound = before - self.pending.len();
        if bound > 0 {
            debug!(bound, waiting = self.pending.len(), "resolved queued attachment points");
        }
    }

    fn notify_refit(&mut self, event: &RefitEvent) {
        for subscriber in &mut self.refit_subscribers {
            subscriber(event);
        }
    }
}
