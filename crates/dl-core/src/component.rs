//! Connectivity-only optimizer backend.
//!
//! Labels anchors with fragment ids as they arrive and reports a merge
//! whenever the device's connected component carries more than one label.
//! It never corrects drift: every correction and adjustment is identity.
//! Used by the simulation harness and the integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::error::OptimizerError;
use crate::ids::{AnchorId, Edge, FragmentId, IdSequence};
use crate::optimizer::{
    AnchorBinding, AnchorPose, FragmentAdjustment, MergeResult, Optimizer, PointAdjustment,
    RefreezeResult,
};
use crate::pose::Pose;
use crate::vector::Vec3;

#[derive(Debug, Default)]
pub struct ComponentOptimizer {
    anchors: BTreeMap<AnchorId, Pose>,
    edges: BTreeSet<Edge>,
    labels: BTreeMap<AnchorId, FragmentId>,
    fragment_ids: IdSequence,
    most_significant: AnchorId,
    refreeze_requested: bool,
}

impl ComponentOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `refreeze_indicated` report true.
    pub fn request_refreeze(&mut self) {
        self.refreeze_requested = true;
    }

    pub fn label_of(&self, id: AnchorId) -> FragmentId {
        self.labels.get(&id).copied().unwrap_or(FragmentId::UNKNOWN)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Distinct fragment labels currently in use.
    pub fn fragment_count(&self) -> usize {
        self.labels.values().collect::<BTreeSet<_>>().len()
    }

    fn neighbors(&self, id: AnchorId) -> impl Iterator<Item = AnchorId> + '_ {
        self.edges.iter().filter_map(move |e| {
            if e.a == id {
                Some(e.b)
            } else if e.b == id {
                Some(e.a)
            } else {
                None
            }
        })
    }

    /// Anchors reachable from `root` over live edges.
    fn component(&self, root: AnchorId) -> BTreeSet<AnchorId> {
        let mut seen = BTreeSet::new();
        if !self.anchors.contains_key(&root) {
            return seen;
        }
        let mut queue = VecDeque::from([root]);
        seen.insert(root);
        while let Some(id) = queue.pop_front() {
            for n in self.neighbors(id) {
                if self.anchors.contains_key(&n) && seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        seen
    }

    /// Labels other than the current fragment's inside the device component.
    fn foreign_labels(&self) -> Vec<FragmentId> {
        let current = self.current_fragment();
        if !current.is_known() {
            return Vec::new();
        }
        let labels: BTreeSet<FragmentId> = self
            .component(self.most_significant)
            .into_iter()
            .map(|id| self.label_of(id))
            .filter(|f| f.is_known() && *f != current)
            .collect();
        labels.into_iter().collect()
    }

    fn relabel(&mut self, from: &[FragmentId], to: FragmentId) {
        for label in self.labels.values_mut() {
            if from.contains(label) {
                *label = to;
            }
        }
    }

    fn nearest(&self, position: Vec3, fragment: FragmentId) -> Option<(AnchorId, Pose)> {
        self.anchors
            .iter()
            .filter(|(id, _)| !fragment.is_known() || self.label_of(**id) == fragment)
            .map(|(id, pose)| (*id, *pose, pose.position.distance(position)))
            .min_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(id, pose, _)| (id, pose))
    }
}

impl Optimizer for ComponentOptimizer {
    fn submit_graph(
        &mut self,
        anchors: &[AnchorPose],
        new_edges: &[Edge],
        most_significant: AnchorId,
    ) -> Result<(), OptimizerError> {
        if most_significant.is_known() && !anchors.iter().any(|a| a.id == most_significant) {
            return Err(OptimizerError::Rejected(format!(
                "most significant anchor {most_significant} not in submitted set"
            )));
        }

        self.anchors = anchors.iter().map(|a| (a.id, a.pose)).collect();
        self.edges.extend(new_edges.iter().copied());
        self.edges
            .retain(|e| self.anchors.contains_key(&e.a) && self.anchors.contains_key(&e.b));
        self.labels.retain(|id, _| self.anchors.contains_key(id));
        self.most_significant = most_significant;

        // New anchors join the lowest labelled neighbor, else found a fragment.
        let unlabelled: Vec<AnchorId> = self
            .anchors
            .keys()
            .filter(|id| !self.labels.contains_key(id))
            .copied()
            .collect();
        for id in unlabelled {
            let inherited = self
                .neighbors(id)
                .filter_map(|n| self.labels.get(&n).copied())
                .min();
            let label = inherited.unwrap_or_else(|| FragmentId(self.fragment_ids.next_raw()));
            debug!(anchor = %id, fragment = %label, "labelled anchor");
            self.labels.insert(id, label);
        }
        Ok(())
    }

    fn merge_indicated(&self) -> bool {
        !self.foreign_labels().is_empty()
    }

    fn refreeze_indicated(&self) -> bool {
        self.refreeze_requested
    }

    fn merge(&mut self) -> Option<MergeResult> {
        let sources = self.foreign_labels();
        if sources.is_empty() {
            return None;
        }
        let target = self.current_fragment();
        self.relabel(&sources, target);
        Some(MergeResult {
            target,
            sources: sources
                .into_iter()
                .map(|fragment| FragmentAdjustment {
                    fragment,
                    adjustment: Pose::IDENTITY,
                })
                .collect(),
        })
    }

    fn refreeze(&mut self) -> Option<RefreezeResult> {
        self.refreeze_requested = false;
        let target = self.current_fragment();
        if !target.is_known() {
            return None;
        }
        let absorbed = self.foreign_labels();
        self.relabel(&absorbed, target);
        Some(RefreezeResult { target, absorbed })
    }

    fn current_fragment(&self) -> FragmentId {
        self.label_of(self.most_significant)
    }

    fn correction_pose(&self) -> Pose {
        Pose::IDENTITY
    }

    fn bind_attachment(
        &self,
        locked_position: Vec3,
        context: Option<&AnchorBinding>,
    ) -> Option<AnchorBinding> {
        let fragment = match context {
            Some(ctx) if ctx.fragment.is_known() => ctx.fragment,
            _ => self.current_fragment(),
        };
        let (anchor, pose) = self
            .nearest(locked_position, fragment)
            .or_else(|| self.nearest(locked_position, FragmentId::UNKNOWN))?;
        Some(AnchorBinding {
            fragment: self.label_of(anchor),
            anchor,
            offset: locked_position - pose.position,
        })
    }

    fn adjust_attachment(&self, binding: &AnchorBinding) -> Option<PointAdjustment> {
        let pose = self.anchors.get(&binding.anchor)?;
        let position = pose.position + binding.offset;
        let fragment = self.label_of(binding.anchor);
        let (anchor, near) = self.nearest(position, fragment)?;
        Some(PointAdjustment {
            binding: AnchorBinding {
                fragment,
                anchor,
                offset: position - near.position,
            },
            adjustment: Pose::IDENTITY,
        })
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}
