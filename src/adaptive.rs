// TICKGOV HOST LOOP
// TWO THREADS, ONE DIRECTION OF DATA:
//   TICK THREAD:  FIXED-RATE LOOP. SAMPLES, DETECTS, DRAINS THE BUDGET QUEUE,
//                 EVALUATES THE PROFILE. PUBLISHES LATEST METRICS AS ATOMICS.
//   TUNER THREAD: SLOW CADENCE. READS THE ATOMICS, RUNS ONE TUNING CYCLE,
//                 PUBLISHES NEW THRESHOLDS THE TICK THREAD READS NEXT CYCLE.
//
// THE HOST ITSELF IS SYNTHETIC: A SEEDED WORKLOAD PRODUCES TICK TIMES, TPS,
// MEMORY AND COUNTERS, AND SUBMITS THE DEFERRABLE WORK A REAL HOST WOULD.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use tickgov::budget::Priority;
use tickgov::governor::Governor;
use tickgov::spike::SpikeEvent;
use tickgov::tuner::{HistoryPoint, ThresholdTuner};
use tickgov::tuning::{self, Profile, SystemCounters};

const TUNER_POLL: Duration = Duration::from_millis(100);
const WORKER_IO_MS: u64 = 20;

// --- SHARED STATE (ATOMICS ONLY, NO MUTEX) ---

pub struct SharedState {
    tps_bits: AtomicU64,
    mem_bits: AtomicU64,
    entity_count: AtomicU64,
    pub tuning_cycles: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            tps_bits: AtomicU64::new(tuning::NOMINAL_TPS.to_bits()),
            mem_bits: AtomicU64::new(0f64.to_bits()),
            entity_count: AtomicU64::new(0),
            tuning_cycles: AtomicU64::new(0),
        }
    }

    fn publish(&self, tps: f64, memory_fraction: f64, entity_count: u64) {
        self.tps_bits.store(tps.to_bits(), Ordering::Relaxed);
        self.mem_bits.store(memory_fraction.to_bits(), Ordering::Relaxed);
        self.entity_count.store(entity_count, Ordering::Relaxed);
    }

    fn point(&self) -> HistoryPoint {
        HistoryPoint {
            throughput: f64::from_bits(self.tps_bits.load(Ordering::Relaxed)),
            memory_fraction: f64::from_bits(self.mem_bits.load(Ordering::Relaxed)),
            entity_count: self.entity_count.load(Ordering::Relaxed),
        }
    }
}

// --- TUNER THREAD ---

// SLEEPS IN SHORT SLICES SO SHUTDOWN IS PROMPT. HANDS THE TUNER BACK ON EXIT.
pub fn tuner_thread(
    mut tuner: ThresholdTuner,
    shared: Arc<SharedState>,
    cadence: Duration,
    shutdown: &'static AtomicBool,
) -> Result<JoinHandle<ThresholdTuner>> {
    thread::Builder::new()
        .name("tickgov-tuner".to_string())
        .spawn(move || {
            let mut next = Instant::now() + cadence;
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(TUNER_POLL.min(cadence));
                if Instant::now() < next {
                    continue;
                }
                next += cadence;

                let t = tuner.tune(shared.point());
                let n = shared.tuning_cycles.fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    "TUNING CYCLE {}: TPS {:.2}/{:.2}/{:.2} LIMITS {}/{}/{}",
                    n, t.tps_light, t.tps_normal, t.tps_aggressive,
                    t.passive_limit, t.hostile_limit, t.item_limit,
                );
            }
            tuner
        })
        .context("failed to spawn tuner thread")
}

// --- SYNTHETIC WORKLOAD ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    // HEALTHY HOST WITH HEADROOM
    Steady,
    // HEALTHY, WITH A BURST OF SLOW TICKS EVERY 15S
    Spiky,
    // THROUGHPUT DECAYS TOWARD 12 TPS
    Overload,
    // MEMORY CLIMBS TO 95%
    Memory,
}

struct HostState {
    tick_ms: f64,
    tps: f64,
    memory_fraction: f64,
    counters: SystemCounters,
}

pub struct Workload {
    scenario: Scenario,
    rng: SmallRng,
    population: Arc<AtomicU64>,
}

const SPIKE_PERIOD: u64 = 300;
const SPIKE_LEN: u64 = 6;

impl Workload {
    pub fn new(scenario: Scenario, seed: u64) -> Self {
        Self {
            scenario,
            rng: SmallRng::seed_from_u64(seed),
            population: Arc::new(AtomicU64::new(2_000)),
        }
    }

    // UNIFORM IN [-1, 1)
    fn jitter(&mut self) -> f64 {
        self.rng.gen_range(-1.0..1.0)
    }

    fn step(&mut self, tick: u64) -> HostState {
        // POPULATION GROWS UNTIL A CLEANUP TASK CULLS IT
        let pop = self.population.fetch_add(3, Ordering::Relaxed) + 3;
        let crowd = (pop as f64 / 20_000.0).min(0.3);

        let (tick_ms, tps, memory_fraction) = match self.scenario {
            Scenario::Steady => (
                tuning::NOMINAL_TICK_MS + 2.0 * self.jitter(),
                19.8 + 0.1 * self.jitter(),
                0.35 + crowd,
            ),
            Scenario::Spiky => {
                if tick % SPIKE_PERIOD < SPIKE_LEN && tick >= SPIKE_PERIOD {
                    (180.0 + 80.0 * self.jitter(), 11.0 + self.jitter(), 0.45 + crowd)
                } else {
                    (tuning::NOMINAL_TICK_MS + 3.0 * self.jitter(),
                        19.6 + 0.2 * self.jitter(), 0.40 + crowd)
                }
            }
            Scenario::Overload => {
                let decay = (tick as f64 / 2_000.0).min(1.0);
                let tps = 20.0 - 8.0 * decay + 0.3 * self.jitter();
                (1000.0 / tps.max(1.0), tps, 0.55 + crowd)
            }
            Scenario::Memory => {
                let climb = (tick as f64 / 1_500.0).min(1.0);
                (tuning::NOMINAL_TICK_MS + 4.0 * self.jitter(),
                    18.6 + 0.3 * self.jitter(), 0.60 + 0.35 * climb)
            }
        };

        HostState {
            tick_ms: tick_ms.max(0.0),
            tps: tps.clamp(0.0, tuning::NOMINAL_TPS),
            memory_fraction: memory_fraction.clamp(0.0, 1.0),
            counters: SystemCounters {
                entity_count: pop,
                loaded_regions: 1_500 + pop / 10,
                sessions: 40,
            },
        }
    }

    // SUBMIT THE DEFERRABLE WORK A HOST WOULD, SHAPED BY THE CURRENT PROFILE
    // AND THE TUNED ENTITY LIMITS
    fn submit(&self, gov: &mut Governor, tick: u64) {
        let d = gov.profile.directives();
        let limits = gov.thresholds().load();

        if tick % u64::from(d.entity_cleanup_interval_ticks.max(1)) == 0 {
            let pop = self.population.clone();
            let cap = u64::from(limits.passive_limit + limits.hostile_limit + limits.item_limit);
            gov.scheduler.schedule(format!("entity-cleanup-{}", tick), move || {
                let before = pop.load(Ordering::Relaxed);
                if before > cap {
                    pop.store(cap + (before - cap) / 2, Ordering::Relaxed);
                }
                busy_wait(Duration::from_micros(400));
                Ok(())
            }, Priority::Low, "entity_processing", 0.5);
        }

        if tick % 20 == 0 {
            let radius = d.hibernate_radius_regions;
            gov.scheduler.schedule(format!("chunk-hibernate-{}", tick), move || {
                busy_wait(Duration::from_micros(50 * u64::from(radius)));
                Ok(())
            }, Priority::Normal, "chunk_processing", 0.3);
        }

        for i in 0..4 {
            gov.scheduler.schedule(format!("ai-{}-{}", tick, i), || {
                busy_wait(Duration::from_micros(150));
                Ok(())
            }, Priority::High, "ai_processing", 0.2);
        }

        if !d.pause_non_critical && tick % 5 == 0 {
            gov.scheduler.schedule_default(format!("stats-{}", tick), || {
                busy_wait(Duration::from_micros(100));
                Ok(())
            }, Priority::Background);
        }

        // I/O OFF THE TICK THREAD, COMPLETION BACK THROUGH THE HANDLE
        if tick % 400 == 0 {
            let handle = gov.scheduler.handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(WORKER_IO_MS));
                handle.schedule(format!("region-save-done-{}", tick), || Ok(()),
                    Priority::Normal, "chunk_processing", 0.1);
            });
        }

        if tick % 1_200 == 0 {
            gov.scheduler.schedule(format!("autosave-{}", tick), || {
                busy_wait(Duration::from_millis(1));
                Ok(())
            }, Priority::Critical, tuning::GENERAL_CATEGORY, 1.0);
        }
    }
}

fn busy_wait(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

// --- TICK LOOP ---

// FIXED-RATE LOOP ON THE CALLING THREAD. RUNS UNTIL SHUTDOWN OR max_ticks.
pub fn tick_loop(
    gov: &mut Governor,
    workload: &mut Workload,
    shared: &SharedState,
    period: Duration,
    max_ticks: Option<u64>,
    shutdown: &'static AtomicBool,
) -> Result<()> {
    let mut tick: u64 = 0;
    let mut cycle: u64 = 0;
    let mut spikes_since_report: u32 = 0;

    println!("{:<8} {:<11} {:<8} {:<7} {:<9} {:<8} {:<7} {:<6} {:<18}",
        "TICK", "PROFILE", "TPS", "MEM%", "BUDGET", "QUEUE", "SPIKES", "TUNE", "TPS THRESHOLDS");

    while !shutdown.load(Ordering::Relaxed) && max_ticks.map_or(true, |m| tick < m) {
        let started = Instant::now();
        tick += 1;

        workload.submit(gov, tick);
        let host = workload.step(tick);
        shared.publish(host.tps, host.memory_fraction, host.counters.entity_count);

        let out = gov.tick_measured(host.tick_ms, host.tps, host.memory_fraction, &host.counters);
        if let Some(SpikeEvent::Started(_)) = out.spike {
            spikes_since_report += 1;
        }

        if tick % gov.control_interval_ticks() == 0 {
            cycle += 1;
            let stable = spikes_since_report == 0 && out.profile_change.is_none();
            if tuning::should_print_telemetry(cycle, stable) {
                let t = gov.thresholds().load();
                println!("{:<8} {:<11} {:<8.2} {:<7.1} {:<9.2} {:<8} {:<7} {:<6} {:.2}/{:.2}/{:.2}",
                    tick, gov.profile.current_profile().label(), host.tps,
                    host.memory_fraction * 100.0, out.budget.budget_ms, out.budget.queue_depth,
                    spikes_since_report, shared.tuning_cycles.load(Ordering::Relaxed),
                    t.tps_light, t.tps_normal, t.tps_aggressive);
            }
            spikes_since_report = 0;
        }

        let elapsed = started.elapsed();
        if elapsed < period {
            thread::sleep(period - elapsed);
        } else if !period.is_zero() {
            debug!("HOST TICK {} RAN LONG: {:?}", tick, elapsed);
        }
    }

    let stats = gov.stats();
    println!();
    println!("TICKS:           {}", stats.ticks);
    println!("PROFILE:         {} ({} TRANSITIONS, {:?})",
        stats.profile.current.label(), stats.profile.transitions, stats.profile.mode);
    println!("TASKS:           {} EXECUTED, {} FAILED, {} QUEUED, {} OVERRUNS",
        stats.scheduler.executed_total, stats.scheduler.failed_total,
        stats.scheduler.queue_depth, stats.scheduler.overruns);
    println!("SPIKES:          {} ({} MITIGATED)",
        stats.spikes.total_spikes, stats.spikes.mitigated_spikes);
    for spike in gov.detector.recent_spikes(3) {
        println!("  {}", spike);
    }
    let t = stats.thresholds;
    println!("THRESHOLDS:      TPS {:.2}/{:.2}/{:.2} LIMITS {}/{}/{}",
        t.tps_light, t.tps_normal, t.tps_aggressive,
        t.passive_limit, t.hostile_limit, t.item_limit);
    if stats.profile.current == Profile::Emergency {
        println!("WARNING:         ENDED IN EMERGENCY PROFILE");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_is_reproducible_per_seed() {
        let mut a = Workload::new(Scenario::Spiky, 42);
        let mut b = Workload::new(Scenario::Spiky, 42);
        for tick in 0..(SPIKE_PERIOD + SPIKE_LEN) {
            let (x, y) = (a.step(tick), b.step(tick));
            assert_eq!(x.tick_ms, y.tick_ms);
            assert_eq!(x.tps, y.tps);
        }
    }

    #[test]
    fn jitter_stays_in_unit_range() {
        let mut w = Workload::new(Scenario::Steady, 7);
        for _ in 0..10_000 {
            let j = w.jitter();
            assert!((-1.0..1.0).contains(&j));
        }
    }
}
