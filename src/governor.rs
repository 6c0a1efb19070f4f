// TICKGOV GOVERNOR
// THE TICK-THREAD SIDE OF THE SYSTEM. ONE CALL PER HOST TICK, IN FIXED ORDER:
// SAMPLE -> SPIKE DETECTOR -> BUDGET SCHEDULER -> (EVERY N TICKS) PROFILE.
// THE THRESHOLD TUNER IS HANDED BACK SEPARATELY FOR ITS OWN THREAD.

use anyhow::{Context, Result};
use log::info;

use crate::budget::{BudgetScheduler, SchedulerStats, TickReport};
use crate::config::GovernorConfig;
use crate::profile::{ProfileChange, ProfileController, ProfileStats};
use crate::sampler::{TickSample, TickSampler};
use crate::spike::{MitigationDispatcher, Mitigator, SpikeDetector, SpikeEvent, SpikeStats};
use crate::tuner::{ThresholdTuner, ThresholdsHandle};
use crate::tuning::{AdaptiveThresholds, SystemCounters};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickOutcome {
    pub sample: TickSample,
    pub spike: Option<SpikeEvent>,
    pub budget: TickReport,
    pub profile_change: Option<ProfileChange>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GovernorStats {
    pub ticks: u64,
    pub scheduler: SchedulerStats,
    pub spikes: SpikeStats,
    pub profile: ProfileStats,
    pub thresholds: AdaptiveThresholds,
}

pub struct Governor {
    pub sampler: TickSampler,
    pub detector: SpikeDetector,
    pub scheduler: BudgetScheduler,
    pub profile: ProfileController,
    thresholds: ThresholdsHandle,
    control_interval_ticks: u64,
    ticks: u64,
}

impl Governor {
    // VALIDATE, BUILD EVERY COMPONENT, START THE SCHEDULER
    pub fn init<M: Mitigator>(
        config: &GovernorConfig,
        mitigator: M,
    ) -> Result<(Self, ThresholdTuner)> {
        config.validate().context("invalid governor configuration")?;

        let thresholds = ThresholdsHandle::new(config.tuner.initial);
        let dispatcher = MitigationDispatcher::spawn(mitigator, config.spike.mitigation_queue)?;
        let mut scheduler = BudgetScheduler::new(&config.budget);
        scheduler.start();

        let governor = Self {
            sampler: TickSampler::new(config.sample_capacity),
            detector: SpikeDetector::new(&config.spike, Some(dispatcher)),
            scheduler,
            profile: ProfileController::new(&config.profile, thresholds.clone()),
            thresholds: thresholds.clone(),
            control_interval_ticks: config.control_interval_ticks,
            ticks: 0,
        };
        let tuner = ThresholdTuner::new(&config.tuner, thresholds);

        info!(
            "GOVERNOR READY: BUDGET {:.1}ms, SPIKE {:.0}/{:.0}ms x{}, CONTROL EVERY {} TICKS",
            config.budget.max_budget_ms, config.spike.spike_threshold_ms,
            config.spike.severe_threshold_ms, config.spike.consecutive_ticks,
            config.control_interval_ticks,
        );
        Ok((governor, tuner))
    }

    // TICK BOUNDARY WITH WALL-CLOCK TIMING
    pub fn tick(&mut self, tps: f64, memory_fraction: f64, counters: &SystemCounters) -> TickOutcome {
        let sample = self.sampler.record(tps, memory_fraction);
        self.after_sample(sample, counters)
    }

    // TICK BOUNDARY WHOSE DURATION THE HOST MEASURED ITSELF
    pub fn tick_measured(
        &mut self,
        tick_ms: f64,
        tps: f64,
        memory_fraction: f64,
        counters: &SystemCounters,
    ) -> TickOutcome {
        let sample = self.sampler.record_at(crate::sampler::now_ns(), tick_ms, tps, memory_fraction);
        self.after_sample(sample, counters)
    }

    fn after_sample(&mut self, sample: TickSample, counters: &SystemCounters) -> TickOutcome {
        self.ticks += 1;
        let spike = self.detector.on_tick(&self.sampler, counters);
        let budget = self.scheduler.run_tick_cycle(sample.throughput);
        let profile_change = if self.ticks % self.control_interval_ticks == 0 {
            self.profile.evaluate(sample.throughput, sample.memory_used_fraction)
        } else {
            None
        };
        TickOutcome { sample, spike, budget, profile_change }
    }

    pub fn thresholds(&self) -> ThresholdsHandle {
        self.thresholds.clone()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn control_interval_ticks(&self) -> u64 {
        self.control_interval_ticks
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            ticks: self.ticks,
            scheduler: self.scheduler.stats(),
            spikes: self.detector.stats(&self.sampler),
            profile: self.profile.stats(),
            thresholds: self.thresholds.load(),
        }
    }
}
