/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// SLERP near-parallel threshold; above this dot product NLERP is used instead
pub const SLERP_THRESHOLD: f64 = 0.9995;

/// Barycentric tolerance when deciding whether a point lies inside a triangle
pub const BARYCENTRIC_TOLERANCE: f64 = 1e-9;

/// Twice-area below which a triangle is treated as degenerate
pub const DEGENERATE_AREA: f64 = 1e-12;

/// Inner radius: no anchor closer than this means a new anchor is proposed (meters)
pub const DEFAULT_MIN_NEW_ANCHOR_DISTANCE: f64 = 1.0;

/// Outer radius: anchors within this distance of a new anchor get an edge (meters)
pub const DEFAULT_MAX_ANCHOR_EDGE_LENGTH: f64 = 1.2;

/// Tracking must be stable this long before anchors are proposed again (seconds)
pub const DEFAULT_TRACKING_START_DELAY: f64 = 0.3;

/// Minimum time between two anchor proposals (seconds)
pub const DEFAULT_ANCHOR_ADD_COOLDOWN: f64 = 0.4;

/// A proposal that has not located within this time is discarded (seconds)
pub const DEFAULT_PENDING_ANCHOR_TIMEOUT: f64 = 3.0;

/// Attachment point moves shorter than this are ignored (meters)
pub const DEFAULT_MIN_MOVE_DISTANCE: f64 = 0.01;

/// Half-size of the square triangulation domain around the origin (meters)
pub const DEFAULT_TRIANGULATION_EXTENT: f64 = 1000.0;

/// Version tag written at the head of a serialized pin record
pub const PIN_RECORD_VERSION: u32 = 1;
