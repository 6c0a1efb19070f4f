// TICKGOV SPIKE DETECTOR
// PER-TICK STATE MACHINE OVER TICK DURATIONS: NORMAL -> ACCUMULATING -> IN_SPIKE.
// THE CONSECUTIVE COUNTER DECAYS BY ONE PER GOOD TICK, SO A SINGLE GOOD TICK
// INSIDE A SPIKE DOES NOT CLOSE IT. MITIGATION RUNS ON A WORKER THREAD.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Sender, TrySendError};
use log::{info, warn};

use crate::config::SpikeConfig;
use crate::sampler::{TickSample, TickSampler};
use crate::tuning::{self, CauseCeilings, LagCause, MitigationTier, SystemCounters};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpikeState {
    Normal,
    Accumulating(u32),
    InSpike,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LagSpike {
    pub start_ns: u64,
    pub end_ns: u64,
    pub peak_tick_ms: f64,
    pub avg_tick_ms: f64,
    pub duration_ticks: u32,
    pub cause: LagCause,
    pub mitigated: bool,
}

impl LagSpike {
    pub fn duration_ms(&self) -> f64 {
        self.end_ns.saturating_sub(self.start_ns) as f64 / 1_000_000.0
    }
}

impl fmt::Display for LagSpike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LagSpike[duration={:.0}ms, peak={:.2}ms/tick, avg={:.2}ms/tick, cause={}, mitigated={}]",
            self.duration_ms(), self.peak_tick_ms, self.avg_tick_ms, self.cause, self.mitigated
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpikeEvent {
    Started(LagSpike),
    Closed(LagSpike),
}

// --- HISTORY ---

// CLOSED SPIKES, BOUNDED. WRITTEN BY THE TICK THREAD, READ BY ANYONE VIA COPIES.
#[derive(Clone)]
pub struct SpikeHistory {
    inner: Arc<RwLock<VecDeque<LagSpike>>>,
    capacity: usize,
}

impl SpikeHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, spike: LagSpike) {
        let mut q = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(spike);
    }

    pub fn snapshot(&self) -> Vec<LagSpike> {
        let q = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        q.iter().copied().collect()
    }

    // NEWEST LAST
    pub fn recent(&self, n: usize) -> Vec<LagSpike> {
        let q = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        q.iter().skip(q.len().saturating_sub(n)).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// --- MITIGATION ---

pub trait Mitigator: Send + 'static {
    // PAUSE NON-CRITICAL WORK BRIEFLY
    fn mitigate_normal(&mut self, spike: &LagSpike) -> Result<()>;
    // RECLAIM MEMORY, PURGE HIGH-CHURN EPHEMERAL STATE
    fn mitigate_severe(&mut self, spike: &LagSpike) -> Result<()>;
}

// ADVISORY ONLY: LOGS WHAT A HOST WOULD DO
pub struct LogMitigator;

impl Mitigator for LogMitigator {
    fn mitigate_normal(&mut self, spike: &LagSpike) -> Result<()> {
        info!("MITIGATION: PAUSING NON-CRITICAL WORK ({})", spike.cause);
        Ok(())
    }

    fn mitigate_severe(&mut self, spike: &LagSpike) -> Result<()> {
        warn!("EMERGENCY: SEVERE LAG ({:.2}ms/tick), REQUESTING MEMORY RECLAIM AND EPHEMERAL PURGE",
            spike.peak_tick_ms);
        Ok(())
    }
}

// BOUNDED QUEUE INTO A SINGLE WORKER. DISPATCH NEVER BLOCKS THE TICK THREAD:
// A FULL QUEUE DROPS THE REQUEST AND REPORTS IT AS NOT MITIGATED.
pub struct MitigationDispatcher {
    tx: Option<Sender<(MitigationTier, LagSpike)>>,
    worker: Option<JoinHandle<()>>,
}

impl MitigationDispatcher {
    pub fn spawn<M: Mitigator>(mut mitigator: M, queue: usize) -> Result<Self> {
        let (tx, rx) = channel::bounded::<(MitigationTier, LagSpike)>(queue.max(1));
        let worker = thread::Builder::new()
            .name("tickgov-mitigate".to_string())
            .spawn(move || {
                for (tier, spike) in rx.iter() {
                    let res = match tier {
                        MitigationTier::Normal => mitigator.mitigate_normal(&spike),
                        MitigationTier::Severe => mitigator.mitigate_severe(&spike),
                    };
                    if let Err(e) = res {
                        warn!("{} MITIGATION FAILED: {:#}", tier.label(), e);
                    }
                }
            })
            .context("failed to spawn mitigation worker")?;
        Ok(Self { tx: Some(tx), worker: Some(worker) })
    }

    pub fn dispatch(&self, tier: MitigationTier, spike: &LagSpike) -> bool {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return false,
        };
        match tx.try_send((tier, *spike)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("MITIGATION QUEUE FULL, {} MITIGATION SKIPPED", tier.label());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for MitigationDispatcher {
    fn drop(&mut self) {
        // DISCONNECT FIRST SO THE WORKER'S LOOP ENDS
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// --- DETECTOR ---

// SUM, COUNT AND PEAK OF A RUN OF TICK DURATIONS. EXACT FOR ANY SPIKE LENGTH,
// INDEPENDENT OF HOW MUCH THE SAMPLER STILL RETAINS.
#[derive(Clone, Copy, Debug, Default)]
struct RunningWindow {
    sum_ms: f64,
    count: u64,
    peak_ms: f64,
}

impl RunningWindow {
    fn add(&mut self, tick_ms: f64) {
        self.sum_ms += tick_ms;
        self.count += 1;
        self.peak_ms = self.peak_ms.max(tick_ms);
    }

    fn absorb(&mut self, other: &RunningWindow) {
        self.sum_ms += other.sum_ms;
        self.count += other.count;
        self.peak_ms = self.peak_ms.max(other.peak_ms);
    }

    fn mean_ms(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum_ms / self.count as f64)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpikeStats {
    pub total_spikes: u64,
    pub mitigated_spikes: u64,
    pub in_spike: bool,
    pub consecutive_over: u32,
    pub avg_tick_ms: f64,
}

pub struct SpikeDetector {
    spike_threshold_ms: f64,
    severe_threshold_ms: f64,
    consecutive_ticks: u32,
    ceilings: CauseCeilings,
    consecutive_over: u32,
    run_start_ns: u64,
    // EVERY TICK FROM THE RUN START THROUGH THE LAST OVER-THRESHOLD TICK
    window: RunningWindow,
    // GOOD TICKS SINCE THE LAST OVER-THRESHOLD TICK, NOT YET PART OF THE WINDOW
    tail: RunningWindow,
    current: Option<LagSpike>,
    history: SpikeHistory,
    dispatcher: Option<MitigationDispatcher>,
    total_spikes: u64,
    mitigated_spikes: u64,
}

impl SpikeDetector {
    pub fn new(config: &SpikeConfig, dispatcher: Option<MitigationDispatcher>) -> Self {
        Self {
            spike_threshold_ms: config.spike_threshold_ms,
            severe_threshold_ms: config.severe_threshold_ms,
            consecutive_ticks: config.consecutive_ticks.max(1),
            ceilings: config.ceilings,
            consecutive_over: 0,
            run_start_ns: 0,
            window: RunningWindow::default(),
            tail: RunningWindow::default(),
            current: None,
            history: SpikeHistory::new(config.history_capacity),
            dispatcher,
            total_spikes: 0,
            mitigated_spikes: 0,
        }
    }

    // CALLED ONCE PER TICK, AFTER THE SAMPLER RECORDED IT
    pub fn on_tick(&mut self, sampler: &TickSampler, counters: &SystemCounters) -> Option<SpikeEvent> {
        let sample = *sampler.latest()?;

        if sample.tick_duration_ms > self.spike_threshold_ms {
            if self.consecutive_over == 0 && self.current.is_none() {
                self.run_start_ns = sample.timestamp_ns;
                self.window = RunningWindow::default();
                self.tail = RunningWindow::default();
            }
            self.window.absorb(&self.tail);
            self.window.add(sample.tick_duration_ms);
            self.tail = RunningWindow::default();
            self.consecutive_over += 1;

            if let Some(spike) = self.current.as_mut() {
                spike.duration_ticks += 1;
                spike.peak_tick_ms = spike.peak_tick_ms.max(sample.tick_duration_ms);
                spike.end_ns = sample.timestamp_ns;
                return None;
            }
            if self.consecutive_over >= self.consecutive_ticks {
                return Some(SpikeEvent::Started(self.open_spike(sample, counters)));
            }
            return None;
        }

        let mut event = None;
        if self.consecutive_over == 0 {
            if let Some(spike) = self.current.take() {
                event = Some(SpikeEvent::Closed(self.close_spike(spike)));
            }
        } else {
            self.tail.add(sample.tick_duration_ms);
        }
        self.consecutive_over = self.consecutive_over.saturating_sub(1);
        event
    }

    fn open_spike(&mut self, latest: TickSample, counters: &SystemCounters) -> LagSpike {
        let start_ns = self.run_start_ns;
        let end_ns = latest.timestamp_ns;
        let peak = self.window.peak_ms;
        let cause = tuning::classify_cause(counters, latest.memory_used_fraction, &self.ceilings);

        let mut spike = LagSpike {
            start_ns,
            end_ns,
            peak_tick_ms: peak,
            avg_tick_ms: 0.0,
            duration_ticks: self.consecutive_over,
            cause,
            mitigated: false,
        };

        warn!("LAG SPIKE DETECTED: {:.2}ms/tick | CAUSE: {}", peak, cause);

        let tier = tuning::mitigation_tier(peak, self.severe_threshold_ms);
        if tier == MitigationTier::Severe {
            warn!("SEVERE LAG SPIKE: {:.2}ms/tick, APPLYING EMERGENCY MITIGATION", peak);
        }
        spike.mitigated = self
            .dispatcher
            .as_ref()
            .map_or(false, |d| d.dispatch(tier, &spike));

        self.total_spikes += 1;
        if spike.mitigated {
            self.mitigated_spikes += 1;
        }
        self.current = Some(spike);
        spike
    }

    fn close_spike(&mut self, mut spike: LagSpike) -> LagSpike {
        spike.avg_tick_ms = self.window.mean_ms().unwrap_or(spike.peak_tick_ms);
        self.tail = RunningWindow::default();
        info!("LAG SPIKE ENDED: {}", spike);
        self.history.push(spike);
        spike
    }

    pub fn state(&self) -> SpikeState {
        if self.current.is_some() {
            SpikeState::InSpike
        } else if self.consecutive_over > 0 {
            SpikeState::Accumulating(self.consecutive_over)
        } else {
            SpikeState::Normal
        }
    }

    pub fn in_spike(&self) -> bool {
        self.current.is_some()
    }

    pub fn consecutive_over(&self) -> u32 {
        self.consecutive_over
    }

    pub fn current_spike(&self) -> Option<LagSpike> {
        self.current
    }

    pub fn history(&self) -> SpikeHistory {
        self.history.clone()
    }

    pub fn recent_spikes(&self, n: usize) -> Vec<LagSpike> {
        self.history.recent(n)
    }

    pub fn stats(&self, sampler: &TickSampler) -> SpikeStats {
        SpikeStats {
            total_spikes: self.total_spikes,
            mitigated_spikes: self.mitigated_spikes,
            in_spike: self.in_spike(),
            consecutive_over: self.consecutive_over,
            avg_tick_ms: sampler.mean_tick_ms().unwrap_or(0.0),
        }
    }
}
