//! Anchor graph maintenance.
//!
//! Keeps a well-spread, connected set of spatial anchors around the device
//! trajectory and pushes it to the optimizer once per tick:
//!
//! - a new anchor is proposed where no located anchor lies inside the inner
//!   radius (`min_new_anchor_distance`), and finalized on a later tick once
//!   the platform reports it located;
//! - a finalized anchor is linked to every anchor that was inside the outer
//!   radius (`max_anchor_edge_length`) when it was proposed;
//! - when several anchors crowd the inner radius, the nearest is linked to
//!   all the others so dense regions do not fragment;
//! - past `max_local_anchors`, the anchor farthest from the device is culled.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::error::OptimizerError;
use crate::ids::{AnchorId, Edge, IdSequence};
use crate::optimizer::{AnchorPose, Optimizer};
use crate::platform::{AnchorPlatform, SpatialHandle};
use crate::pose::Pose;
use crate::settings::AnchorSettings;
use crate::vector::Vec3;

/// Status string reported while the device is not tracked.
pub const LOST_TRACKING_STATUS: &str = "lost tracking";

/// A finalized anchor.
#[derive(Clone, Debug)]
pub struct Anchor {
    pub id: AnchorId,
    pub handle: SpatialHandle,
    /// Last pose reported by the platform, spongy frame.
    pub pose: Pose,
    pub located: bool,
}

/// A proposal waiting for the platform to locate it.
#[derive(Clone, Debug)]
struct PendingAnchor {
    handle: SpatialHandle,
    pose: Pose,
    neighbors: Vec<AnchorId>,
    proposed_at: f64,
}

/// What happened during one tracked tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnchorTickReport {
    /// Nearest located anchor to the device, submitted as most significant.
    pub most_significant: AnchorId,
    pub proposed: bool,
    pub finalized: Option<AnchorId>,
    /// A proposal timed out without locating and was discarded.
    pub expired: bool,
    pub culled: Option<AnchorId>,
    /// Edges handed to the optimizer this tick.
    pub submitted_edges: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnchorUpdate {
    /// Tracking unavailable; the graph was left untouched.
    TrackingLost,
    Tracked(AnchorTickReport),
}

/// Distances from the device to located anchors, nearest first.
struct Proximity {
    nearest: Option<(AnchorId, f64)>,
    inner: Vec<AnchorId>,
    outer: Vec<AnchorId>,
}

pub struct AnchorGraphMaintainer {
    settings: AnchorSettings,
    anchors: BTreeMap<AnchorId, Anchor>,
    edges: BTreeSet<Edge>,
    unsent_edges: Vec<Edge>,
    pending: Option<PendingAnchor>,
    ids: IdSequence,
    error_status: String,
    tracking: bool,
    tracking_lost_at: Option<f64>,
    last_proposal_at: Option<f64>,
}

impl AnchorGraphMaintainer {
    pub fn new(settings: AnchorSettings) -> Self {
        Self {
            settings,
            anchors: BTreeMap::new(),
            edges: BTreeSet::new(),
            unsent_edges: Vec::new(),
            pending: None,
            ids: IdSequence::default(),
            error_status: String::new(),
            tracking: true,
            tracking_lost_at: None,
            last_proposal_at: None,
        }
    }

    pub fn settings(&self) -> &AnchorSettings {
        &self.settings
    }

    pub fn anchors(&self) -> impl Iterator<Item = &Anchor> {
        self.anchors.values()
    }

    pub fn anchor(&self, id: AnchorId) -> Option<&Anchor> {
        self.anchors.get(&id)
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Pose of the outstanding proposal, if any.
    pub fn pending(&self) -> Option<Pose> {
        self.pending.as_ref().map(|p| p.pose)
    }

    /// Empty while tracked; a human-readable reason otherwise.
    pub fn error_status(&self) -> &str {
        &self.error_status
    }

    /// Run one tick of the graph policy and submit the result.
    ///
    /// Returns `TrackingLost` (not an error) when the platform is not
    /// tracking. An `Err` means the optimizer refused the submission; edges
    /// created this tick are kept and resubmitted on the next tick.
    pub fn update(
        &mut self,
        now: f64,
        platform: &mut dyn AnchorPlatform,
        optimizer: &mut dyn Optimizer,
    ) -> Result<AnchorUpdate, OptimizerError> {
        if !platform.is_tracking() {
            self.handle_tracking_lost(now, platform);
            return Ok(AnchorUpdate::TrackingLost);
        }
        if !self.tracking {
            info!("tracking regained");
            self.tracking = true;
            self.error_status.clear();
        }

        let mut report = AnchorTickReport::default();
        self.refresh_anchor_poses(platform);

        match self.try_finalize(now, platform) {
            Finalize::Finalized(id) => report.finalized = Some(id),
            Finalize::Expired => report.expired = true,
            Finalize::Waiting | Finalize::Nothing => {}
        }

        let device = platform.device_pose().position;
        let proximity = self.proximity(device);

        let far_from_all = proximity
            .nearest
            .is_none_or(|(_, d)| d >= self.settings.min_new_anchor_distance);
        if far_from_all
            && report.finalized.is_none()
            && self.pending.is_none()
            && !self.cooling_down(now)
        {
            report.proposed = self.propose(now, device, proximity.outer.clone(), platform);
        }

        if proximity.inner.len() >= 2
            && let Some((nearest, _)) = proximity.nearest
        {
            for &other in proximity.inner.iter().filter(|&&id| id != nearest) {
                self.add_edge(Edge::new(nearest, other));
            }
        }

        report.culled = self.cull_farthest(device, platform);

        let most_significant = self
            .proximity(device)
            .nearest
            .map(|(id, _)| id)
            .unwrap_or(AnchorId::UNKNOWN);
        report.most_significant = most_significant;

        let located: Vec<AnchorPose> = self
            .anchors
            .values()
            .filter(|a| a.located)
            .map(|a| AnchorPose {
                id: a.id,
                pose: a.pose,
            })
            .collect();

        if let Err(e) = optimizer.submit_graph(&located, &self.unsent_edges, most_significant) {
            warn!("graph submission failed, retrying next tick: {e}");
            return Err(e);
        }
        report.submitted_edges = self.unsent_edges.len();
        self.unsent_edges.clear();

        Ok(AnchorUpdate::Tracked(report))
    }

    /// Destroy every anchor and forget all edges.
    pub fn reset(&mut self, platform: &mut dyn AnchorPlatform) {
        for anchor in self.anchors.values() {
            platform.destroy_anchor(anchor.handle);
        }
        if let Some(p) = self.pending.take() {
            platform.destroy_anchor(p.handle);
        }
        self.anchors.clear();
        self.edges.clear();
        self.unsent_edges.clear();
        self.last_proposal_at = None;
        info!("anchor graph reset");
    }

    fn handle_tracking_lost(&mut self, now: f64, platform: &mut dyn AnchorPlatform) {
        if let Some(p) = self.pending.take() {
            debug!("discarding pending anchor on tracking loss");
            platform.destroy_anchor(p.handle);
        }
        if self.tracking {
            info!("tracking lost");
            self.tracking = false;
        }
        self.tracking_lost_at = Some(now);
        self.error_status = LOST_TRACKING_STATUS.to_string();
    }

    fn refresh_anchor_poses(&mut self, platform: &dyn AnchorPlatform) {
        for anchor in self.anchors.values_mut() {
            match platform.locate_anchor(anchor.handle) {
                Some(pose) => {
                    anchor.pose = pose;
                    anchor.located = true;
                }
                None => anchor.located = false,
            }
        }
    }

    fn try_finalize(&mut self, now: f64, platform: &mut dyn AnchorPlatform) -> Finalize {
        let Some(pending) = self.pending.as_ref() else {
            return Finalize::Nothing;
        };

        if let Some(pose) = platform.locate_anchor(pending.handle) {
            let Some(pending) = self.pending.take() else {
                return Finalize::Nothing;
            };
            let id = AnchorId(self.ids.next_raw());
            self.anchors.insert(
                id,
                Anchor {
                    id,
                    handle: pending.handle,
                    pose,
                    located: true,
                },
            );
            for n in pending.neighbors {
                if self.anchors.contains_key(&n) {
                    self.add_edge(Edge::new(id, n));
                }
            }
            debug!(anchor = %id, "finalized anchor");
            return Finalize::Finalized(id);
        }

        if now - pending.proposed_at > self.settings.pending_anchor_timeout {
            debug!("pending anchor never located, discarding");
            platform.destroy_anchor(pending.handle);
            self.pending = None;
            return Finalize::Expired;
        }
        Finalize::Waiting
    }

    fn proximity(&self, device: Vec3) -> Proximity {
        let mut measured: Vec<(AnchorId, f64)> = self
            .anchors
            .values()
            .filter(|a| a.located)
            .map(|a| (a.id, a.pose.position.distance(device)))
            .collect();
        measured.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        Proximity {
            nearest: measured.first().copied(),
            inner: measured
                .iter()
                .filter(|(_, d)| *d < self.settings.min_new_anchor_distance)
                .map(|(id, _)| *id)
                .collect(),
            outer: measured
                .iter()
                .filter(|(_, d)| *d <= self.settings.max_anchor_edge_length)
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    fn cooling_down(&self, now: f64) -> bool {
        let regained = self
            .tracking_lost_at
            .is_some_and(|t| now - t < self.settings.tracking_start_delay);
        let recent = self
            .last_proposal_at
            .is_some_and(|t| now - t < self.settings.anchor_add_cooldown);
        regained || recent
    }

    fn propose(
        &mut self,
        now: f64,
        device: Vec3,
        neighbors: Vec<AnchorId>,
        platform: &mut dyn AnchorPlatform,
    ) -> bool {
        // Orientation is reset so anchors stay gravity-agnostic.
        let pose = Pose::from_position(device);
        let Some(handle) = platform.create_anchor(pose) else {
            debug!("platform declined anchor creation");
            return false;
        };
        debug!(neighbors = neighbors.len(), "proposed anchor at {device:?}");
        self.pending = Some(PendingAnchor {
            handle,
            pose,
            neighbors,
            proposed_at: now,
        });
        self.last_proposal_at = Some(now);
        true
    }

    fn add_edge(&mut self, edge: Edge) {
        if edge.a != edge.b && self.edges.insert(edge) {
            self.unsent_edges.push(edge);
        }
    }

    fn cull_farthest(&mut self, device: Vec3, platform: &mut dyn AnchorPlatform) -> Option<AnchorId> {
        let cap = self.settings.max_local_anchors;
        if cap == 0 || self.anchors.len() <= cap {
            return None;
        }
        let farthest = self
            .anchors
            .values()
            .map(|a| (a.id, a.pose.position.distance(device)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| id)?;

        let anchor = self.anchors.remove(&farthest)?;
        platform.destroy_anchor(anchor.handle);
        self.edges.retain(|e| !e.touches(farthest));
        self.unsent_edges.retain(|e| !e.touches(farthest));
        debug!(anchor = %farthest, "culled farthest anchor");
        Some(farthest)
    }
}

enum Finalize {
    Nothing,
    Waiting,
    Expired,
    Finalized(AnchorId),
}
