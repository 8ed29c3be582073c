//! Synthetic session: a seeded random walk through a room with occasional
//! tracking dropouts, driving the full stabilizer tick by tick.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use dl_core::{
    AttachmentCallbacks, AttachmentRequest, AttachmentState, ComponentOptimizer, PinRecord, Pose,
    Quaternion, RefitKind, SimulatedPlatform, Stabilizer, StabilizerSettings, TickSummary, Vec3,
};
use dl_store::PinStore;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

const TICK_SECONDS: f64 = 0.1;
const EYE_HEIGHT: f64 = 1.6;
const ROOM_RADIUS: f64 = 6.0;
const DROPOUT_CHANCE: f64 = 0.01;

/// Virtual positions of the generated pins, on the floor plane.
const PIN_LAYOUT: [(&str, f64, f64); 3] =
    [("north", 0.0, 3.0), ("east", 3.0, 0.0), ("west", -3.0, -1.0)];

pub struct SimOptions {
    pub ticks: usize,
    pub seed: u64,
    pub pins_in: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub ticks: usize,
    pub tracked_ticks: usize,
    pub anchors: usize,
    pub edges: usize,
    pub fragments: usize,
    pub merges: usize,
    pub refreezes: usize,
    pub pins: usize,
    pub restored_pins: usize,
    pub marker_state: AttachmentState,
    pub marker_adjustments: usize,
    pub last: Option<TickSummary>,
}

pub struct SimRun {
    pub summary: RunSummary,
    pub pins: Vec<PinRecord>,
}

struct Walk {
    rng: SmallRng,
    position: Vec3,
    heading: f64,
    dropout: usize,
}

impl Walk {
    fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            position: Vec3::new(0.0, EYE_HEIGHT, 0.0),
            heading: 0.0,
            dropout: 0,
        }
    }

    /// Advance one frame. Returns the device pose and whether it is tracked.
    fn step(&mut self) -> (Pose, bool) {
        let flat = Vec3::new(self.position.x, 0.0, self.position.z);
        if flat.length() > ROOM_RADIUS {
            self.heading = (-flat.z).atan2(-flat.x);
        } else {
            self.heading += self.rng.random_range(-0.4..0.4);
        }
        let stride = self.rng.random_range(0.05..0.25);
        self.position += Vec3::new(self.heading.cos() * stride, 0.0, self.heading.sin() * stride);

        if self.dropout > 0 {
            self.dropout -= 1;
        } else if self.rng.random_bool(DROPOUT_CHANCE) {
            self.dropout = self.rng.random_range(3..12);
            debug!(frames = self.dropout, "tracking dropout");
        }
        (
            Pose::new(self.position, Quaternion::from_yaw(-self.heading)),
            self.dropout == 0,
        )
    }
}

pub fn run_simulation(settings: StabilizerSettings, options: &SimOptions) -> Result<SimRun> {
    let mut stab = Stabilizer::new(settings, SimulatedPlatform::default(), ComponentOptimizer::new())
        .context("stabilizer refused the settings")?;
    let mut walk = Walk::new(options.seed);

    let adjustments = Rc::new(Cell::new(0usize));
    let counter = Rc::clone(&adjustments);
    let marker = stab.create_attachment_point(
        AttachmentRequest::new("marker", Vec3::new(0.0, 0.0, 0.0)),
        AttachmentCallbacks::none().on_adjust(move |_| counter.set(counter.get() + 1)),
    );

    let mut loader = options.pins_in.as_ref().map(|path| {
        let store = PinStore::new(path);
        store.request_load();
        store
    });
    let mut loaded: Option<Vec<PinRecord>> = None;
    let mut pins_placed = false;
    let mut restored_pins = 0;

    let (mut merges, mut refreezes, mut tracked_ticks) = (0, 0, 0);
    let mut last = None;
    for tick in 0..options.ticks {
        if let Some(result) = loader.as_ref().and_then(PinStore::poll_load) {
            loaded = apply_loaded(&mut stab, result);
            loader = None;
        }
        if !pins_placed && stab.fragments().current_fragment().is_known() {
            if let Some(store) = loader.take() {
                store.wait_idle();
                if let Some(result) = store.poll_load() {
                    loaded = apply_loaded(&mut stab, result);
                }
            }
            restored_pins = place_pins(&mut stab, loaded.take(), &mut walk.rng);
            pins_placed = true;
        }

        let (device, tracking) = walk.step();
        let platform = stab.platform_mut();
        platform.set_device_pose(device);
        platform.set_tracking(tracking);

        let report = stab.update(tick as f64 * TICK_SECONDS);
        stab.platform_mut().step();

        if report.anchors.is_tracked() {
            tracked_ticks += 1;
        }
        for refit in &report.refits {
            match refit.kind {
                RefitKind::Merge => merges += 1,
                RefitKind::Refreeze => refreezes += 1,
            }
        }
        last = Some(report);
    }

    let marker_state = stab
        .attachment(marker)
        .map(|p| p.state())
        .unwrap_or(AttachmentState::Released);
    let summary = RunSummary {
        ticks: options.ticks,
        tracked_ticks,
        anchors: stab.anchors().anchor_count(),
        edges: stab.anchors().edges().len(),
        fragments: stab.optimizer().fragment_count(),
        merges,
        refreezes,
        pins: stab.blender().active_pins().len(),
        restored_pins,
        marker_state,
        marker_adjustments: adjustments.get(),
        last: last.as_ref().map(TickSummary::from),
    };
    info!(
        anchors = summary.anchors,
        fragments = summary.fragments,
        merges,
        refreezes,
        "simulation finished"
    );
    Ok(SimRun {
        summary,
        pins: stab.save_pins(),
    })
}

/// Hand successfully loaded records to the blender. A failed load leaves
/// it untouched and the run falls back to fresh pins.
fn apply_loaded(
    stab: &mut Stabilizer<SimulatedPlatform, ComponentOptimizer>,
    result: dl_store::Result<Vec<PinRecord>>,
) -> Option<Vec<PinRecord>> {
    match result {
        Ok(records) => {
            stab.load_pins(records.clone());
            Some(records)
        }
        Err(e) => {
            warn!(error = %e, "pin record not restored, placing fresh pins");
            None
        }
    }
}

/// Restore loaded pins by name, or lay out fresh ones when nothing was
/// loaded. Returns how many pins were restored.
fn place_pins(
    stab: &mut Stabilizer<SimulatedPlatform, ComponentOptimizer>,
    loaded: Option<Vec<PinRecord>>,
    rng: &mut SmallRng,
) -> usize {
    let restored = loaded
        .unwrap_or_default()
        .iter()
        .filter(|r| stab.restore_alignment_anchor(&r.name, r.virtual_pose).is_known())
        .count();

    if restored == 0 {
        for (name, x, z) in PIN_LAYOUT {
            let virtual_pose = Pose::from_position(Vec3::new(x, 0.0, z));
            let locked_pose = Pose::from_position(Vec3::new(
                x + rng.random_range(-0.1..0.1),
                0.0,
                z + rng.random_range(-0.1..0.1),
            ));
            stab.add_alignment_anchor(name, virtual_pose, locked_pose);
        }
    }
    stab.send_alignment_anchors();
    restored
}
