// TICKGOV THRESHOLD TUNER
// SLOW-CADENCE LOOP OVER A BOUNDED HISTORY WINDOW. EACH CYCLE RECOMPUTES THE
// WHOLE THRESHOLD SET FROM tuning.rs LAWS AND PUBLISHES IT IN ONE ATOMIC STORE.
// READERS NEVER SEE A HALF-WRITTEN SET.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::debug;

use crate::config::TunerConfig;
use crate::tuning::{self, AdaptiveThresholds};

// SINGLE WRITER (THE TUNER), ANY NUMBER OF READERS
#[derive(Clone)]
pub struct ThresholdsHandle(Arc<AtomicCell<AdaptiveThresholds>>);

impl ThresholdsHandle {
    pub fn new(initial: AdaptiveThresholds) -> Self {
        Self(Arc::new(AtomicCell::new(initial)))
    }

    pub fn load(&self) -> AdaptiveThresholds {
        self.0.load()
    }

    pub(crate) fn store(&self, t: AdaptiveThresholds) {
        self.0.store(t);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HistoryPoint {
    pub throughput: f64,
    pub memory_fraction: f64,
    pub entity_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryAverages {
    pub throughput: f64,
    pub memory_fraction: f64,
    pub entity_count: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Smoothing {
    Simple,
    Ewma { alpha: f64 },
}

pub struct HistoryWindow {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, p: HistoryPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(p);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() == self.capacity
    }

    pub fn averages(&self) -> Option<HistoryAverages> {
        Some(HistoryAverages {
            throughput: tuning::simple_average(self.points.iter().map(|p| p.throughput))?,
            memory_fraction: tuning::simple_average(self.points.iter().map(|p| p.memory_fraction))?,
            entity_count: tuning::simple_average(self.points.iter().map(|p| p.entity_count as f64))?,
        })
    }

    pub fn ewma(&self, alpha: f64) -> Option<HistoryAverages> {
        Some(HistoryAverages {
            throughput: tuning::ewma(self.points.iter().map(|p| p.throughput), alpha)?,
            memory_fraction: tuning::ewma(self.points.iter().map(|p| p.memory_fraction), alpha)?,
            entity_count: tuning::ewma(self.points.iter().map(|p| p.entity_count as f64), alpha)?,
        })
    }

    pub fn smoothed(&self, smoothing: Smoothing) -> Option<HistoryAverages> {
        match smoothing {
            Smoothing::Simple => self.averages(),
            Smoothing::Ewma { alpha } => self.ewma(alpha),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TunerStats {
    pub cycles: u64,
    pub window_len: usize,
    pub thresholds: AdaptiveThresholds,
    pub last_averages: Option<HistoryAverages>,
}

pub struct ThresholdTuner {
    window: HistoryWindow,
    smoothing: Smoothing,
    min_gap: f64,
    handle: ThresholdsHandle,
    cycles: u64,
    last_averages: Option<HistoryAverages>,
}

impl ThresholdTuner {
    pub fn new(config: &TunerConfig, handle: ThresholdsHandle) -> Self {
        Self {
            window: HistoryWindow::new(config.window_capacity),
            smoothing: config.smoothing,
            min_gap: config.min_gap,
            handle,
            cycles: 0,
            last_averages: None,
        }
    }

    pub fn handle(&self) -> ThresholdsHandle {
        self.handle.clone()
    }

    pub fn window(&self) -> &HistoryWindow {
        &self.window
    }

    // ONE TUNING CYCLE: RECORD THE LATEST POINT, THEN RETUNE
    pub fn tune(&mut self, point: HistoryPoint) -> AdaptiveThresholds {
        self.window.push(point);
        self.retune()
    }

    // RECOMPUTE FROM THE CURRENT WINDOW. EMPTY WINDOW: NO-OP.
    pub fn retune(&mut self) -> AdaptiveThresholds {
        let current = self.handle.load();
        let avg = match self.window.smoothed(self.smoothing) {
            Some(a) => a,
            None => return current,
        };
        self.cycles += 1;
        self.last_averages = Some(avg);

        let next = tuning::nudge_tps_thresholds(current, avg.throughput, self.min_gap);
        let next = tuning::adapt_entity_limits(next, avg.memory_fraction, avg.throughput);

        debug!(
            "TUNE #{}: AVG TPS={:.2} MEM={:.1}% ENTITIES={:.0} -> TPS {:.2}/{:.2}/{:.2}",
            self.cycles, avg.throughput, avg.memory_fraction * 100.0, avg.entity_count,
            next.tps_light, next.tps_normal, next.tps_aggressive,
        );
        if (next.passive_limit, next.hostile_limit, next.item_limit)
            != (current.passive_limit, current.hostile_limit, current.item_limit)
        {
            debug!(
                "ENTITY LIMITS: PASSIVE {} -> {}, HOSTILE {} -> {}, ITEM {} -> {}",
                current.passive_limit, next.passive_limit,
                current.hostile_limit, next.hostile_limit,
                current.item_limit, next.item_limit,
            );
        }

        if next != current {
            self.handle.store(next);
        }
        next
    }

    pub fn stats(&self) -> TunerStats {
        TunerStats {
            cycles: self.cycles,
            window_len: self.window.len(),
            thresholds: self.handle.load(),
            last_averages: self.last_averages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuner(capacity: usize) -> ThresholdTuner {
        let mut cfg = TunerConfig::default();
        cfg.window_capacity = capacity;
        ThresholdTuner::new(&cfg, ThresholdsHandle::new(AdaptiveThresholds::default()))
    }

    fn point(tps: f64, mem: f64) -> HistoryPoint {
        HistoryPoint { throughput: tps, memory_fraction: mem, entity_count: 1_000 }
    }

    #[test]
    fn empty_window_is_noop() {
        let mut t = tuner(4);
        let before = t.handle().load();
        assert_eq!(t.retune(), before);
        assert_eq!(t.stats().cycles, 0);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = HistoryWindow::new(2);
        w.push(point(10.0, 0.1));
        w.push(point(20.0, 0.1));
        w.push(point(30.0, 0.1));
        assert!(w.is_full());
        assert_eq!(w.averages().unwrap().throughput, 25.0);
    }

    #[test]
    fn ewma_weights_recent_points() {
        let mut w = HistoryWindow::new(4);
        w.push(point(10.0, 0.0));
        w.push(point(20.0, 0.0));
        let e = w.ewma(0.5).unwrap();
        assert_eq!(e.throughput, 15.0);
        assert_eq!(w.smoothed(Smoothing::Simple), w.averages());
    }

    #[test]
    fn handle_sees_published_thresholds() {
        let mut t = tuner(4);
        let reader = t.handle();
        let out = t.tune(point(19.9, 0.3));
        assert_eq!(reader.load(), out);
        assert!(out.tps_light > AdaptiveThresholds::default().tps_light);
    }

    #[test]
    fn mid_band_leaves_tps_thresholds() {
        let mut t = tuner(4);
        let out = t.tune(point(18.0, 0.6));
        let d = AdaptiveThresholds::default();
        assert_eq!(out, d);
    }
}
