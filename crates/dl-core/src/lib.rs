//! Driftlock world-locking engine.
//!
//! Keeps virtual content fixed to the physical world while device tracking
//! drifts. Three stages run once per frame:
//!
//! - the anchor graph maintainer lays spatial anchors along the device path
//!   and feeds them to a pose-graph optimizer;
//! - the fragment reconciler follows the optimizer's connectivity islands
//!   and keeps client attachment points bound, adjusted and notified;
//! - the alignment blender turns named virtual/locked pins into one
//!   spatially blended correction pose.
//!
//! Zero I/O. Persistence lives in `dl-store`; platforms and optimizers plug
//! in through the [`AnchorPlatform`] and [`Optimizer`] traits.

pub mod alignment;
pub mod anchor_graph;
pub mod attachment;
pub mod component;
pub mod constants;
pub mod error;
pub mod fragment;
pub mod ids;
pub mod optimizer;
pub mod platform;
pub mod pose;
pub mod quaternion;
pub mod settings;
pub mod stabilizer;
pub mod triangulate;
pub mod vector;

pub use alignment::{AlignmentBlender, AlignmentContext, AlignmentMode, PinRecord, ReferencePose};
pub use anchor_graph::{Anchor, AnchorGraphMaintainer, AnchorTickReport, AnchorUpdate};
pub use attachment::{AttachmentCallbacks, AttachmentPoint, AttachmentRequest, AttachmentState};
pub use component::ComponentOptimizer;
pub use constants::{EPSILON, PIN_RECORD_VERSION, SLERP_THRESHOLD};
pub use error::{ConfigValidationError, OptimizerError};
pub use fragment::{Fragment, FragmentReconciler, RefitEvent, RefitKind};
pub use ids::{AnchorId, AttachmentId, Edge, FragmentId, PinId};
pub use optimizer::{
    AnchorBinding, AnchorPose, FragmentAdjustment, MergeResult, Optimizer, PointAdjustment,
    RefreezeResult,
};
pub use platform::{AnchorPlatform, NullPlatform, SimulatedPlatform, SpatialHandle};
pub use pose::{Pose, WeightedPose};
pub use quaternion::Quaternion;
pub use settings::{
    AlignmentSettings, AnchorSettings, FragmentSettings, PersistenceSettings, StabilizerSettings,
};
pub use stabilizer::{AnchorStatus, Stabilizer, TickReport, TickSummary};
pub use triangulate::{Bounds2, Interpolant, Triangulator};
pub use vector::{Vec2, Vec3};
