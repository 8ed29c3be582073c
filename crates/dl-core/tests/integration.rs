//! Integration tests exercising the full stabilization pipeline:
//! anchors → fragments → alignment, across module boundaries.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use dl_core::{
    AlignmentBlender, AlignmentContext, AlignmentMode, AnchorBinding, AnchorId, AnchorPose,
    AnchorStatus, AttachmentCallbacks, AttachmentId, AttachmentRequest, AttachmentState,
    ComponentOptimizer, Edge, FragmentAdjustment, FragmentId, FragmentReconciler,
    FragmentSettings, MergeResult, Optimizer, OptimizerError, PinRecord, PointAdjustment, Pose,
    Quaternion, RefitKind, RefreezeResult, SimulatedPlatform, Stabilizer, StabilizerSettings,
    Vec3,
};
use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(42)
}

fn at(x: f64, y: f64, z: f64) -> Pose {
    Pose::from_position(Vec3::new(x, y, z))
}

type Sim = Stabilizer<SimulatedPlatform, ComponentOptimizer>;

fn sim(settings: StabilizerSettings) -> Sim {
    Stabilizer::new(settings, SimulatedPlatform::new(0), ComponentOptimizer::new()).unwrap()
}

/// Drive the stabilizer along a list of device positions, one tick each.
fn drive(stab: &mut Sim, start: f64, path: &[Vec3]) -> f64 {
    let mut now = start;
    for &p in path {
        stab.platform_mut().set_device_pose(Pose::from_position(p));
        stab.update(now);
        stab.platform_mut().step();
        now += 0.1;
    }
    now
}

/// Scripted optimizer: fixed current fragment, one anchor per fragment at
/// the origin, queued merge/refreeze answers.
#[derive(Default)]
struct Scripted {
    current: FragmentId,
    merge: Option<MergeResult>,
    refreeze: Option<RefreezeResult>,
    delta: Pose,
}

impl Optimizer for Scripted {
    fn submit_graph(
        &mut self,
        _anchors: &[AnchorPose],
        _new_edges: &[Edge],
        _most_significant: AnchorId,
    ) -> Result<(), OptimizerError> {
        Ok(())
    }

    fn merge_indicated(&self) -> bool {
        self.merge.is_some()
    }

    fn refreeze_indicated(&self) -> bool {
        self.refreeze.is_some()
    }

    fn merge(&mut self) -> Option<MergeResult> {
        self.merge.take()
    }

    fn refreeze(&mut self) -> Option<RefreezeResult> {
        self.refreeze.take()
    }

    fn current_fragment(&self) -> FragmentId {
        self.current
    }

    fn correction_pose(&self) -> Pose {
        Pose::IDENTITY
    }

    fn bind_attachment(
        &self,
        locked_position: Vec3,
        context: Option<&AnchorBinding>,
    ) -> Option<AnchorBinding> {
        let fragment = context.map(|c| c.fragment).unwrap_or(self.current);
        Some(AnchorBinding {
            fragment,
            anchor: AnchorId(fragment.0),
            offset: locked_position,
        })
    }

    fn adjust_attachment(&self, binding: &AnchorBinding) -> Option<PointAdjustment> {
        Some(PointAdjustment {
            binding: AnchorBinding {
                fragment: self.current,
                anchor: AnchorId(self.current.0),
                offset: self.delta.transform_point(binding.offset),
            },
            adjustment: self.delta,
        })
    }
}

#[derive(Default)]
struct Counts {
    adjusts: BTreeMap<&'static str, usize>,
    states: BTreeMap<&'static str, Vec<AttachmentState>>,
}

fn counted(counts: &Rc<RefCell<Counts>>, name: &'static str) -> AttachmentCallbacks {
    let a = Rc::clone(counts);
    let s = Rc::clone(counts);
    AttachmentCallbacks::none()
        .on_adjust(move |_| *a.borrow_mut().adjusts.entry(name).or_default() += 1)
        .on_state(move |st| s.borrow_mut().states.entry(name).or_default().push(st))
}

/// Bind one point into each of the given fragments, in order.
fn spread(
    rec: &mut FragmentReconciler,
    opt: &mut Scripted,
    counts: &Rc<RefCell<Counts>>,
    layout: &[(&'static str, FragmentId, Vec3)],
) -> Vec<AttachmentId> {
    layout
        .iter()
        .map(|&(name, fragment, position)| {
            opt.current = fragment;
            rec.update(opt, true, true);
            rec.create_attachment_point(
                &*opt,
                AttachmentRequest::new(name, position),
                counted(counts, name),
            )
        })
        .collect()
}

/// Test 1: two pins, head halfway between them: the correction is the even
/// blend of both pins' corrections.
#[test]
fn two_pin_blend_is_even() {
    let mut stab = sim(StabilizerSettings::default());
    let now = drive(&mut stab, 0.0, &[Vec3::ZERO; 3]);
    assert!(stab.fragments().current_fragment().is_known());

    let p1 = stab.add_alignment_anchor("p1", at(0.0, 0.0, 0.0), at(0.0, 0.0, 0.0));
    let p2 = stab.add_alignment_anchor("p2", at(1.0, 0.0, 0.0), at(1.0, 0.0, 0.1));
    assert!(p1.is_known() && p2.is_known());
    stab.send_alignment_anchors();

    drive(&mut stab, now, &[Vec3::new(0.5, 0.0, 0.05)]);
    let correction = stab.blender().pinned_from_locked();
    assert!(
        correction.approx_eq(at(0.0, 0.0, -0.05), 1e-9),
        "got {correction:?}"
    );
}

/// Test 2: refreeze absorbs fragment 2 into fragment 1 with adjustment Δ.
#[test]
fn refreeze_moves_absorbed_point_by_delta() {
    let counts = Rc::new(RefCell::new(Counts::default()));
    let mut opt = Scripted::default();
    let mut rec = FragmentReconciler::new(FragmentSettings::default());
    let old = Vec3::new(2.0, 0.0, -1.0);
    let ids = spread(
        &mut rec,
        &mut opt,
        &counts,
        &[("moved", FragmentId(2), old), ("anchor", FragmentId(1), Vec3::ZERO)],
    );
    rec.update(&mut opt, true, true);
    *counts.borrow_mut() = Counts::default();

    let delta = Pose::new(Vec3::new(0.5, 0.0, 0.0), Quaternion::from_yaw(0.25));
    opt.delta = delta;
    opt.refreeze = Some(RefreezeResult {
        target: FragmentId(1),
        absorbed: vec![FragmentId(2)],
    });
    let refits = rec.update(&mut opt, true, true);
    assert_eq!(refits.len(), 1);
    assert_eq!(refits[0].kind, RefitKind::Refreeze);

    let point = rec.attachment(ids[0]).unwrap();
    assert!(point.position().distance(delta.transform_point(old)) < 1e-12);
    assert_eq!(point.fragment(), FragmentId(1));
    assert_eq!(point.state(), AttachmentState::Normal);

    let counts = counts.borrow();
    assert_eq!(counts.adjusts.get("moved"), Some(&1));
    assert_eq!(counts.adjusts.get("anchor"), Some(&1));
    assert_eq!(counts.states.get("moved"), Some(&vec![AttachmentState::Normal]));
    assert_eq!(counts.states.get("anchor"), None);
}

/// Test 3: a merge folding {A, B} into C notifies every moved point once.
#[test]
fn merge_notifies_each_moved_point_once() {
    let counts = Rc::new(RefCell::new(Counts::default()));
    let mut opt = Scripted::default();
    let mut rec = FragmentReconciler::new(FragmentSettings::default());
    let (a, b, c) = (FragmentId(2), FragmentId(3), FragmentId(1));
    spread(
        &mut rec,
        &mut opt,
        &counts,
        &[
            ("a1", a, Vec3::new(1.0, 0.0, 0.0)),
            ("a2", a, Vec3::new(1.5, 0.0, 0.0)),
            ("b1", b, Vec3::new(0.0, 0.0, 3.0)),
            ("c1", c, Vec3::ZERO),
        ],
    );
    rec.update(&mut opt, true, true);
    *counts.borrow_mut() = Counts::default();

    opt.merge = Some(MergeResult {
        target: c,
        sources: vec![
            FragmentAdjustment {
                fragment: a,
                adjustment: at(0.1, 0.0, 0.0),
            },
            FragmentAdjustment {
                fragment: b,
                adjustment: at(0.0, 0.0, -0.2),
            },
        ],
    });
    let refits = rec.update(&mut opt, true, true);
    assert_eq!(refits[0].absorbed, vec![a, b]);
    assert_eq!(rec.fragment_ids(), vec![c]);
    assert_eq!(rec.points_in(c).len(), 4);

    let counts = counts.borrow();
    for name in ["a1", "a2", "b1"] {
        assert_eq!(counts.states.get(name), Some(&vec![AttachmentState::Normal]), "{name}");
        assert_eq!(counts.adjusts.get(name), Some(&1), "{name}");
    }
    assert_eq!(counts.states.get("c1"), None);
    assert_eq!(counts.adjusts.get("c1"), None);
}

/// A committed pin keeps following refits while a same-name replacement
/// waits in the staged set.
#[test]
fn restaged_pin_keeps_active_pin_synced() {
    let mut opt = Scripted {
        current: FragmentId(2),
        ..Scripted::default()
    };
    let mut rec = FragmentReconciler::new(FragmentSettings::default());
    rec.update(&mut opt, true, true);
    let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
    let locked = at(2.0, 0.0, -1.0);

    let mut ctx = AlignmentContext {
        fragments: &mut rec,
        optimizer: &opt,
    };
    blender.add_alignment_anchor(&mut ctx, "door", at(0.0, 0.0, 1.0), locked);
    blender.send_alignment_anchors();
    blender.compute_pinned_pose(&rec, Pose::IDENTITY);

    let mut ctx = AlignmentContext {
        fragments: &mut rec,
        optimizer: &opt,
    };
    blender.add_alignment_anchor(&mut ctx, "door", at(0.0, 0.0, 2.0), locked);

    let delta = Pose::new(Vec3::new(0.5, 0.0, 0.0), Quaternion::from_yaw(0.25));
    opt.current = FragmentId(1);
    opt.delta = delta;
    opt.refreeze = Some(RefreezeResult {
        target: FragmentId(1),
        absorbed: vec![FragmentId(2)],
    });
    let refits = rec.update(&mut opt, true, true);
    assert_eq!(refits.len(), 1);
    for event in &refits {
        blender.handle_refit(&rec, event);
    }

    let active = &blender.active_pins()[0];
    let expected = delta.transform_point(locked.position);
    assert!(active.locked_pose.position.distance(expected) < 1e-12);
    assert_eq!(active.fragment, FragmentId(1));
}

/// Breadth-first reachability over the undirected edge set.
fn connected(edges: &BTreeSet<Edge>, from: AnchorId, to: AnchorId) -> bool {
    let mut seen = BTreeSet::from([from]);
    let mut frontier = vec![from];
    while let Some(id) = frontier.pop() {
        if id == to {
            return true;
        }
        for edge in edges.iter().filter(|e| e.touches(id)) {
            let next = if edge.a == id { edge.b } else { edge.a };
            if seen.insert(next) {
                frontier.push(next);
            }
        }
    }
    false
}

/// Test 4: a long random walk with a cap and tracking dropouts keeps the
/// graph invariants: bounded size, edges between live anchors, close
/// anchors connected, and an anchor near the device unless a proposal is
/// in flight or held back by a cooldown.
#[test]
fn random_walk_keeps_graph_invariants() {
    let mut rng = rng();
    let mut settings = StabilizerSettings::default();
    settings.anchors.max_local_anchors = 8;
    let inner = settings.anchors.min_new_anchor_distance;
    let cooldown = settings.anchors.anchor_add_cooldown;
    let start_delay = settings.anchors.tracking_start_delay;
    let mut stab = sim(settings);

    let door = stab.create_attachment_point(
        AttachmentRequest::new("door", Vec3::new(0.5, 1.0, 0.5)),
        AttachmentCallbacks::none(),
    );

    let mut position = Vec3::ZERO;
    let mut dropout = 0;
    let mut last_proposal = f64::NEG_INFINITY;
    let mut last_lost = f64::NEG_INFINITY;
    let mut previous: BTreeSet<AnchorId> = BTreeSet::new();
    for tick in 0..400 {
        let now = tick as f64 * 0.1;
        position += Vec3::new(rng.random_range(-0.3..0.3), 0.0, rng.random_range(-0.3..0.3));
        if dropout > 0 {
            dropout -= 1;
        } else if tick < 350 && rng.random_bool(0.02) {
            dropout = rng.random_range(2..6);
        }

        let platform = stab.platform_mut();
        platform.set_device_pose(Pose::from_position(position));
        platform.set_tracking(dropout == 0);
        let report = stab.update(now);
        stab.platform_mut().step();

        let anchors = stab.anchors();
        assert!(anchors.anchor_count() <= 8);
        for edge in anchors.edges() {
            assert!(anchors.anchor(edge.a).is_some() && anchors.anchor(edge.b).is_some());
        }

        let settled: Vec<_> = anchors.anchors().filter(|a| previous.contains(&a.id)).collect();
        for (i, a) in settled.iter().enumerate() {
            for b in &settled[i + 1..] {
                if a.pose.position.distance(b.pose.position) < inner {
                    assert!(
                        connected(anchors.edges(), a.id, b.id),
                        "tick {tick}: {} and {} are close but unconnected",
                        a.id,
                        b.id
                    );
                }
            }
        }
        previous = anchors.anchors().map(|a| a.id).collect();

        match &report.anchors {
            AnchorStatus::Tracked(tick_report) => {
                if tick_report.proposed {
                    last_proposal = now;
                }
                let nearest = anchors
                    .anchors()
                    .filter(|a| a.located)
                    .map(|a| a.pose.position.distance(position))
                    .fold(f64::INFINITY, f64::min);
                let held_back = now - last_proposal < cooldown || now - last_lost < start_delay;
                assert!(
                    nearest < inner || anchors.pending().is_some() || held_back,
                    "tick {tick}: nearest anchor {nearest:.2} m away and nothing proposed"
                );
            }
            AnchorStatus::TrackingLost => last_lost = now,
            AnchorStatus::SubmissionFailed(e) => panic!("tick {tick}: submission failed: {e}"),
        }

        for fragment in stab.fragments().fragment_ids() {
            for id in stab.fragments().points_in(fragment) {
                assert_eq!(stab.attachment(id).unwrap().fragment(), fragment);
            }
        }
    }
    let point = stab.attachment(door).unwrap();
    assert_ne!(point.state(), AttachmentState::Pending);
}

/// Test 5: a pin survives save → load → restore with the same correction.
#[test]
fn pins_restore_after_reload() {
    let mut stab = sim(StabilizerSettings::default());
    let now = drive(&mut stab, 0.0, &[Vec3::ZERO; 3]);
    let virt = at(2.0, 0.0, 1.0);
    stab.add_alignment_anchor("marker", virt, at(0.3, 0.0, 0.2));
    stab.send_alignment_anchors();
    let now = drive(&mut stab, now, &[Vec3::ZERO]);
    let before = stab.blender().pinned_from_locked();

    let json = serde_json::to_string(&stab.save_pins()).unwrap();
    let records: Vec<PinRecord> = serde_json::from_str(&json).unwrap();

    stab.reset();
    let now = drive(&mut stab, now, &[Vec3::ZERO; 3]);
    stab.load_pins(records);
    assert!(stab.restore_alignment_anchor("marker", virt).is_known());
    stab.send_alignment_anchors();
    drive(&mut stab, now, &[Vec3::ZERO]);
    assert!(stab.blender().pinned_from_locked().approx_eq(before, 1e-12));
}

/// Single-fragment world with a component optimizer, ready for pins.
fn pinned_world() -> (ComponentOptimizer, FragmentReconciler) {
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

proptest! {
    /// Two computes with the same head pose and pins agree bit for bit.
    #[test]
    fn blend_is_idempotent(
        pins in prop::collection::vec((-4.0f64..4.0, -4.0f64..4.0, -0.5f64..0.5), 1..6),
        hx in -6.0f64..6.0,
        hz in -6.0f64..6.0,
    ) {
        let (opt, mut rec) = pinned_world();
        let mut blender = AlignmentBlender::new(AlignmentMode::Global, 1000.0);
        {
            let mut ctx = AlignmentContext { fragments: &mut rec, optimizer: &opt };
            for (i, (x, z, yaw)) in pins.iter().enumerate() {
                let locked = at(*x, 0.0, *z);
                let virt = Pose::new(Vec3::new(x + 0.1, 0.0, *z), Quaternion::from_yaw(*yaw));
                blender.add_alignment_anchor(&mut ctx, &format!("pin{i}"), virt, locked);
            }
        }
        blender.send_alignment_anchors();

        let head = at(hx, 0.0, hz);
        let a = blender.compute_pinned_pose(&rec, head);
        let b = blender.compute_pinned_pose(&rec, head);
        prop_assert!(a.bitwise_eq(b));
        prop_assert!(a.is_finite());
    }
}
