//! Tick orchestration.
//!
//! [`Stabilizer`] is the explicit context object: it owns the platform
//! adapter, the optimizer and the three stages, and runs them once per
//! frame in a fixed order. Nothing here is global.

use serde::Serialize;
use tracing::{error, info};

use crate::alignment::{AlignmentBlender, AlignmentContext, AlignmentMode, PinRecord};
use crate::anchor_graph::{AnchorGraphMaintainer, AnchorTickReport, AnchorUpdate};
use crate::attachment::{AttachmentCallbacks, AttachmentPoint, AttachmentRequest};
use crate::error::ConfigValidationError;
use crate::fragment::{FragmentReconciler, RefitEvent};
use crate::ids::{AttachmentId, FragmentId, PinId};
use crate::optimizer::Optimizer;
use crate::platform::AnchorPlatform;
use crate::pose::Pose;
use crate::settings::StabilizerSettings;
use crate::vector::Vec3;

/// Outcome of the anchor stage for one tick.
#[derive(Clone, Debug, PartialEq)]
pub enum AnchorStatus {
    Tracked(AnchorTickReport),
    TrackingLost,
    /// The optimizer refused the graph; fragments were left untouched.
    SubmissionFailed(String),
}

impl AnchorStatus {
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub anchors: AnchorStatus,
    pub current_fragment: FragmentId,
    pub refits: Vec<RefitEvent>,
    pub locked_from_spongy: Pose,
    pub pinned_from_locked: Pose,
    /// The correction handed to rendering.
    pub pinned_from_spongy: Pose,
}

/// Condensed tick output for logs and the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct TickSummary {
    pub tracked: bool,
    pub current_fragment: FragmentId,
    pub refits: usize,
    pub pinned_from_spongy: [f64; 7],
}

impl From<&TickReport> for TickSummary {
    fn from(report: &TickReport) -> Self {
        Self {
            tracked: report.anchors.is_tracked(),
            current_fragment: report.current_fragment,
            refits: report.refits.len(),
            pinned_from_spongy: report.pinned_from_spongy.to_array(),
        }
    }
}

pub struct Stabilizer<P: AnchorPlatform, O: Optimizer> {
    settings: StabilizerSettings,
    platform: P,
    optimizer: O,
    anchors: AnchorGraphMaintainer,
    fragments: FragmentReconciler,
    blender: AlignmentBlender,
}

impl<P: AnchorPlatform, O: Optimizer> Stabilizer<P, O> {
    /// Validate settings and assemble the pipeline. Invalid settings are
    /// logged and refused.
    pub fn new(
        settings: StabilizerSettings,
        platform: P,
        optimizer: O,
    ) -> Result<Self, ConfigValidationError> {
        if let Err(e) = settings.validate() {
            error!("refusing to start: {e}");
            return Err(e);
        }
        Ok(Self {
            anchors: AnchorGraphMaintainer::new(settings.anchors.clone()),
            fragments: FragmentReconciler::new(settings.fragments.clone()),
            blender: AlignmentBlender::new(
                AlignmentMode::Global,
                settings.alignment.triangulation_extent,
            ),
            settings,
            platform,
            optimizer,
        })
    }

    pub fn settings(&self) -> &StabilizerSettings {
        &self.settings
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn anchors(&self) -> &AnchorGraphMaintainer {
        &self.anchors
    }

    pub fn fragments(&self) -> &FragmentReconciler {
        &self.fragments
    }

    pub fn blender(&self) -> &AlignmentBlender {
        &self.blender
    }

    /// Context for application-owned independent blenders.
    pub fn alignment_context(&mut self) -> AlignmentContext<'_> {
        AlignmentContext {
            fragments: &mut self.fragments,
            optimizer: &self.optimizer,
        }
    }

    pub fn subscribe_refit(&mut self, f: impl FnMut(&RefitEvent) + 'static) {
        self.fragments.subscribe_refit(f);
    }

    /// Run one frame: anchors, fragments, then alignment.
    pub fn update(&mut self, now: f64) -> TickReport {
        let anchors = match self
            .anchors
            .update(now, &mut self.platform, &mut self.optimizer)
        {
            Ok(AnchorUpdate::Tracked(report)) => AnchorStatus::Tracked(report),
            Ok(AnchorUpdate::TrackingLost) => AnchorStatus::TrackingLost,
            Err(e) => AnchorStatus::SubmissionFailed(e.to_string()),
        };

        let refits = match &anchors {
            AnchorStatus::Tracked(_) => self.fragments.update(
                &mut self.optimizer,
                self.settings.fragments.auto_refreeze,
                self.settings.fragments.auto_merge,
            ),
            AnchorStatus::TrackingLost => {
                self.fragments.pause();
                Vec::new()
            }
            AnchorStatus::SubmissionFailed(_) => Vec::new(),
        };
        for event in &refits {
            self.blender.handle_refit(&self.fragments, event);
        }

        let locked_from_spongy = self.optimizer.correction_pose();
        let locked_head = locked_from_spongy * self.platform.device_pose();
        let pinned_from_locked = self.blender.compute_pinned_pose(&self.fragments, locked_head);

        TickReport {
            anchors,
            current_fragment: self.fragments.current_fragment(),
            refits,
            locked_from_spongy,
            pinned_from_locked,
            pinned_from_spongy: pinned_from_locked * locked_from_spongy,
        }
    }

    pub fn create_attachment_point(
        &mut self,
        request: AttachmentRequest,
        callbacks: AttachmentCallbacks,
    ) -> AttachmentId {
        self.fragments
            .create_attachment_point(&self.optimizer, request, callbacks)
    }

    pub fn release_attachment_point(&mut self, id: AttachmentId) -> bool {
        self.fragments.release_attachment_point(id)
    }

    pub fn move_attachment_point(&mut self, id: AttachmentId, position: Vec3) -> bool {
        self.fragments
            .move_attachment_point(&self.optimizer, id, position)
    }

    pub fn teleport_attachment_point(&mut self, id: AttachmentId, position: Vec3) -> bool {
        self.fragments
            .teleport_attachment_point(&self.optimizer, id, position)
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<&AttachmentPoint> {
        self.fragments.attachment(id)
    }

    pub fn add_alignment_anchor(&mut self, name: &str, virtual_pose: Pose, locked_pose: Pose) -> PinId {
        let mut ctx = AlignmentContext {
            fragments: &mut self.fragments,
            optimizer: &self.optimizer,
        };
        self.blender
            .add_alignment_anchor(&mut ctx, name, virtual_pose, locked_pose)
    }

    pub fn remove_alignment_anchor(&mut self, id: PinId) -> bool {
        self.blender
            .remove_alignment_anchor(&mut self.fragments, id)
    }

    pub fn clear_alignment_anchors(&mut self) {
        self.blender.clear_alignment_anchors(&mut self.fragments);
    }

    pub fn send_alignment_anchors(&mut self) {
        self.blender.send_alignment_anchors();
    }

    pub fn restore_alignment_anchor(&mut self, name: &str, virtual_pose: Pose) -> PinId {
        let mut ctx = AlignmentContext {
            fragments: &mut self.fragments,
            optimizer: &self.optimizer,
        };
        self.blender
            .restore_alignment_anchor(&mut ctx, name, virtual_pose)
    }

    pub fn save_pins(&self) -> Vec<PinRecord> {
        self.blender.save_record()
    }

    pub fn load_pins(&mut self, records: Vec<PinRecord>) {
        self.blender.load_record(records);
    }

    pub fn subscribe_restored(&mut self, f: impl FnMut(&[String]) + 'static) {
        self.blender.subscribe_restored(f);
    }

    /// Forget anchors, pins and fragments. Attachment points survive and
    /// rebind once a fragment becomes current again.
    pub fn reset(&mut self) {
        self.blender.reset(&mut self.fragments);
        self.anchors.reset(&mut self.platform);
        self.fragments.reset();
        self.optimizer.reset();
        info!("stabilizer reset");
    }
}
