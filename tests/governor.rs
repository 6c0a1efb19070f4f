// TICKGOV END-TO-END TESTS
// COMPONENTS WIRED THE WAY A HOST WIRES THEM: SCHEDULER ADMISSION, SPIKE
// LIFECYCLE, PROFILE IDEMPOTENCE, TUNER CONVERGENCE

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{self, Sender};

use tickgov::budget::{BudgetScheduler, Priority};
use tickgov::config::{BudgetConfig, GovernorConfig, ProfileConfig, SpikeConfig, TunerConfig};
use tickgov::governor::Governor;
use tickgov::profile::ProfileController;
use tickgov::sampler::TickSampler;
use tickgov::spike::{LagSpike, Mitigator, SpikeDetector, SpikeEvent, SpikeState};
use tickgov::tuner::{HistoryPoint, ThresholdTuner, ThresholdsHandle};
use tickgov::tuning::{
    AdaptiveThresholds, LagCause, MitigationTier, Profile, SystemCounters,
    DEFAULT_MIN_GAP, HOSTILE_FLOOR, ITEM_FLOOR, PASSIVE_FLOOR,
};

const MS: u64 = 1_000_000;

fn spin(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

fn counted(n: &Arc<AtomicU32>, cost: Duration) -> impl FnOnce() -> Result<()> + Send + 'static {
    let n = n.clone();
    move || {
        spin(cost);
        n.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// FORWARDS EVERY DISPATCHED MITIGATION TO THE TEST
struct Recorder(Sender<(MitigationTier, LagSpike)>);

impl Mitigator for Recorder {
    fn mitigate_normal(&mut self, spike: &LagSpike) -> Result<()> {
        let _ = self.0.send((MitigationTier::Normal, *spike));
        Ok(())
    }

    fn mitigate_severe(&mut self, spike: &LagSpike) -> Result<()> {
        let _ = self.0.send((MitigationTier::Severe, *spike));
        Ok(())
    }
}

// === SCHEDULER ===

#[test]
fn critical_admitted_regardless_of_budgets() {
    let mut sched = BudgetScheduler::new(&BudgetConfig {
        max_budget_ms: 20.0,
        categories: vec![("general".to_string(), 0.01)],
    });
    sched.start();

    let ran = Arc::new(AtomicU32::new(0));
    for i in 0..3 {
        sched.schedule(format!("crit-{}", i), counted(&ran, Duration::from_millis(1)),
            Priority::Critical, "general", 500.0);
    }
    let report = sched.run_tick_cycle(20.0);

    assert_eq!(ran.load(Ordering::Relaxed), 3);
    assert_eq!(report.executed, 3);
    assert_eq!(sched.queue_depth(), 0);
    assert!(sched.category("general").unwrap().budget_used_ms > 0.01);
}

#[test]
fn exhausted_category_does_not_block_others() {
    let mut sched = BudgetScheduler::new(&BudgetConfig {
        max_budget_ms: 40.0,
        categories: vec![("entity".to_string(), 1.0), ("chunk".to_string(), 10.0)],
    });
    sched.start();

    let entity = Arc::new(AtomicU32::new(0));
    let chunk = Arc::new(AtomicU32::new(0));
    for i in 0..3 {
        sched.schedule(format!("entity-{}", i), counted(&entity, Duration::from_millis(2)),
            Priority::High, "entity", 0.1);
    }
    sched.schedule("chunk-0", counted(&chunk, Duration::ZERO), Priority::Low, "chunk", 0.1);

    let report = sched.run_tick_cycle(20.0);
    assert_eq!(entity.load(Ordering::Relaxed), 1);
    assert_eq!(chunk.load(Ordering::Relaxed), 1);
    assert_eq!(report.set_aside, 2);
    assert_eq!(sched.queue_depth(), 2);
    assert_eq!(sched.category("entity").unwrap().queued_count, 2);

    // NEXT TICK THE ENTITY CATEGORY HAS A FRESH ALLOWANCE
    sched.run_tick_cycle(20.0);
    assert_eq!(entity.load(Ordering::Relaxed), 2);
}

#[test]
fn critical_runs_background_deferred() {
    let mut sched = BudgetScheduler::new(&BudgetConfig {
        max_budget_ms: 40.0,
        ..BudgetConfig::default()
    });
    sched.start();

    let ran = Arc::new(Mutex::new(Vec::new()));
    let log = |name: &'static str| {
        let ran = ran.clone();
        move || {
            ran.lock().unwrap().push(name);
            Ok::<(), anyhow::Error>(())
        }
    };
    sched.schedule("background", log("background"), Priority::Background, "general", 50.0);
    sched.schedule("critical", log("critical"), Priority::Critical, "general", 100.0);
    sched.schedule("normal", log("normal"), Priority::Normal, "general", 1.0);

    let report = sched.run_tick_cycle(20.0);
    assert_eq!(report.budget_ms, 40.0);
    assert_eq!(*ran.lock().unwrap(), vec!["critical", "normal"]);
    assert_eq!(sched.queue_depth(), 1);

    // STILL TOO BIG FOR A 40MS BUDGET: STAYS QUEUED, NEVER DROPPED
    sched.run_tick_cycle(20.0);
    assert_eq!(sched.queue_depth(), 1);
}

// === SPIKE DETECTOR ===

#[test]
fn sustained_lag_classified_and_mitigated() {
    let (tx, rx) = channel::unbounded();
    let mut cfg = GovernorConfig::default();
    cfg.control_interval_ticks = 1_000;
    let (mut gov, _tuner) = Governor::init(&cfg, Recorder(tx)).unwrap();
    let counters = SystemCounters { entity_count: 15_000, loaded_regions: 200, sessions: 10 };

    let mut started_at = None;
    for tick in 1..=5 {
        let out = gov.tick_measured(120.0, 8.3, 0.5, &counters);
        if let Some(SpikeEvent::Started(spike)) = out.spike {
            assert!(started_at.is_none());
            started_at = Some(tick);
            assert_eq!(spike.cause, LagCause::HighEntityCount(15_000));
            assert_eq!(spike.peak_tick_ms, 120.0);
            assert!(spike.mitigated);
        }
    }
    assert_eq!(started_at, Some(3));
    assert_eq!(gov.detector.state(), SpikeState::InSpike);
    assert_eq!(gov.detector.current_spike().unwrap().duration_ticks, 5);

    let (tier, spike) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(tier, MitigationTier::Normal);
    assert_eq!(spike.cause, LagCause::HighEntityCount(15_000));
}

#[test]
fn severe_peak_dispatches_severe_tier() {
    let (tx, rx) = channel::unbounded();
    let (mut gov, _tuner) = Governor::init(&GovernorConfig::default(), Recorder(tx)).unwrap();
    let counters = SystemCounters::default();
    for d in [150.0, 260.0, 140.0] {
        gov.tick_measured(d, 5.0, 0.95, &counters);
    }
    let (tier, spike) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(tier, MitigationTier::Severe);
    assert_eq!(spike.peak_tick_ms, 260.0);
    assert_eq!(spike.cause, LagCause::HighMemory(0.95));
}

#[test]
fn spike_peak_monotonic_and_close_average_exact() {
    let mut det = SpikeDetector::new(&SpikeConfig::default(), None);
    let mut sampler = TickSampler::new(128);
    let counters = SystemCounters::default();

    let durations = [
        60.0, 101.0, 180.0, 130.0, 40.0, 220.0, 105.0, 150.0, 90.0, 70.0, 160.0,
        50.0, 50.0, 50.0, 50.0, 50.0, 50.0, 50.0, 50.0,
    ];
    let mut last_peak = 0.0;
    let mut closed = None;
    for (i, d) in durations.iter().enumerate() {
        sampler.record_at((i as u64 + 1) * 50 * MS, *d, 15.0, 0.4);
        match det.on_tick(&sampler, &counters) {
            Some(SpikeEvent::Closed(spike)) => closed = Some(spike),
            _ => {}
        }
        if let Some(spike) = det.current_spike() {
            assert!(spike.peak_tick_ms >= last_peak);
            last_peak = spike.peak_tick_ms;
        }
    }

    let spike = closed.expect("spike should close after the good run");
    assert_eq!(spike.peak_tick_ms, 220.0);
    assert_eq!(spike.start_ns, 2 * 50 * MS);
    assert_eq!(spike.end_ns, 11 * 50 * MS);

    let inside: Vec<f64> = sampler
        .iter_between(spike.start_ns, spike.end_ns)
        .map(|s| s.tick_duration_ms)
        .collect();
    let mean = inside.iter().sum::<f64>() / inside.len() as f64;
    assert!((spike.avg_tick_ms - mean).abs() < 1e-9);
    assert_eq!(det.history().snapshot(), vec![spike]);
}

#[test]
fn history_readable_from_another_thread() {
    let mut cfg = SpikeConfig::default();
    cfg.consecutive_ticks = 1;
    let mut det = SpikeDetector::new(&cfg, None);
    let reader = det.history();
    let mut sampler = TickSampler::new(64);
    let counters = SystemCounters::default();

    let t = std::thread::spawn(move || {
        let mut seen = 0;
        for _ in 0..200 {
            seen = seen.max(reader.snapshot().len());
            std::thread::yield_now();
        }
        seen
    });

    let mut ts = 0;
    for _ in 0..10 {
        for d in [120.0, 40.0, 40.0] {
            ts += 50 * MS;
            sampler.record_at(ts, d, 19.0, 0.2);
            det.on_tick(&sampler, &counters);
        }
    }
    assert!(t.join().unwrap() <= 10);
    assert_eq!(det.history().len(), 10);
}

// === PROFILE CONTROLLER ===

#[test]
fn repeated_evaluation_is_idempotent() {
    let mut ctl = ProfileController::new(
        &ProfileConfig::default(),
        ThresholdsHandle::new(AdaptiveThresholds::default()),
    );
    let fired = Arc::new(AtomicU32::new(0));
    let f = fired.clone();
    ctl.subscribe(move |_| {
        f.fetch_add(1, Ordering::Relaxed);
    });

    let first = ctl.evaluate(17.2, 0.5);
    let second = ctl.evaluate(17.2, 0.5);
    assert_eq!(first.map(|c| c.to), Some(Profile::Aggressive));
    assert!(second.is_none());
    assert_eq!(ctl.current_profile(), Profile::Aggressive);
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(ctl.stats().transitions, 1);
    assert_eq!(ctl.recent_changes().len(), 1);
}

// === THRESHOLD TUNER ===

fn tuner_with_window(window: usize) -> ThresholdTuner {
    let mut cfg = TunerConfig::default();
    cfg.window_capacity = window;
    ThresholdTuner::new(&cfg, ThresholdsHandle::new(cfg.initial))
}

#[test]
fn steady_headroom_settles_light() {
    let mut cfg = GovernorConfig::default();
    cfg.control_interval_ticks = 1;
    cfg.tuner.window_capacity = 10;
    let (mut gov, mut tuner) = Governor::init(&cfg, Recorder(channel::unbounded().0)).unwrap();
    let counters = SystemCounters { entity_count: 3_000, ..SystemCounters::default() };

    for _ in 0..10 {
        gov.tick_measured(50.0, 19.8, 0.4, &counters);
    }
    assert_eq!(gov.profile.current_profile(), Profile::Light);
    assert_eq!(gov.profile.stats().evaluations, 10);

    let before = gov.thresholds().load();
    let point = HistoryPoint { throughput: 19.8, memory_fraction: 0.4, entity_count: 3_000 };
    for _ in 0..10 {
        tuner.tune(point);
    }
    assert!(tuner.window().is_full());

    let after = gov.thresholds().load();
    assert!(after.tps_light > before.tps_light);
    assert!(after.tps_normal > before.tps_normal);
    assert!(after.tps_aggressive > before.tps_aggressive);
    // HEALTHY AND LOW MEMORY: LIMITS GROW TOO
    assert!(after.passive_limit > before.passive_limit);

    // TUNED THRESHOLDS ARE READ LIVE: THE SAME HOST STAYS LIGHT
    for _ in 0..10 {
        gov.tick_measured(50.0, 19.8, 0.4, &counters);
    }
    assert_eq!(gov.profile.current_profile(), Profile::Light);
    assert_eq!(gov.profile.stats().transitions, 1);
}

#[test]
fn ordering_holds_after_every_cycle() {
    let mut tuner = tuner_with_window(5);
    let series = [20.0, 19.9, 12.0, 5.0, 18.0, 19.6, 0.0, 20.0, 16.0, 19.7];
    for round in 0..20 {
        for (i, tps) in series.iter().enumerate() {
            let t = tuner.tune(HistoryPoint {
                throughput: *tps,
                memory_fraction: ((round + i) % 10) as f64 / 10.0,
                entity_count: 1_000,
            });
            assert!(t.tps_light - t.tps_normal >= DEFAULT_MIN_GAP - 1e-9, "{:?}", t);
            assert!(t.tps_normal - t.tps_aggressive >= DEFAULT_MIN_GAP - 1e-9, "{:?}", t);
        }
    }
}

#[test]
fn memory_pressure_shrinks_to_floors() {
    let mut tuner = tuner_with_window(60);
    let point = HistoryPoint { throughput: 18.0, memory_fraction: 0.95, entity_count: 8_000 };

    let mut prev = tuner.handle().load();
    for _ in 0..60 {
        let t = tuner.tune(point);
        assert!(t.passive_limit <= prev.passive_limit);
        assert!(t.hostile_limit <= prev.hostile_limit);
        assert!(t.item_limit <= prev.item_limit);
        assert!(t.passive_limit >= PASSIVE_FLOOR);
        assert!(t.hostile_limit >= HOSTILE_FLOOR);
        assert!(t.item_limit >= ITEM_FLOOR);
        prev = t;
    }
    assert!(tuner.window().is_full());
    assert_eq!((prev.passive_limit, prev.hostile_limit, prev.item_limit),
        (PASSIVE_FLOOR, HOSTILE_FLOOR, ITEM_FLOOR));
    assert_eq!(tuner.stats().cycles, 60);
}

#[test]
fn empty_tuner_cycle_is_noop() {
    let mut tuner = tuner_with_window(8);
    let before = tuner.handle().load();
    assert_eq!(tuner.retune(), before);
    assert_eq!(tuner.retune(), before);
    assert_eq!(tuner.stats().cycles, 0);
}
