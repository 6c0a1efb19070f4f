// TICKGOV TICK SAMPLER
// ONE TIMING/RESOURCE SAMPLE PER TICK, HELD IN A PRE-ALLOCATED RING.
// NO HEAP ALLOCATION AFTER CONSTRUCTION. OLDEST SAMPLE OVERWRITTEN AT CAPACITY.

use crate::tuning::NOMINAL_TICK_MS;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickSample {
    pub timestamp_ns: u64,
    pub tick_duration_ms: f64,
    pub throughput: f64,
    pub memory_used_fraction: f64,
}

const EMPTY: TickSample = TickSample {
    timestamp_ns: 0,
    tick_duration_ms: 0.0,
    throughput: 0.0,
    memory_used_fraction: 0.0,
};

pub struct TickSampler {
    samples: Vec<TickSample>,
    head: usize,
    len: usize,
    last_boundary_ns: Option<u64>,
}

impl TickSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![EMPTY; capacity.max(1)],
            head: 0,
            len: 0,
            last_boundary_ns: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // RECORD AT A TICK BOUNDARY. DURATION IS WALL TIME SINCE THE PREVIOUS
    // BOUNDARY; THE FIRST TICK HAS NO PREDECESSOR AND COUNTS AS NOMINAL.
    pub fn record(&mut self, throughput: f64, memory_used_fraction: f64) -> TickSample {
        let now = now_ns();
        let tick_ms = match self.last_boundary_ns {
            Some(prev) => now.saturating_sub(prev) as f64 / 1_000_000.0,
            None => NOMINAL_TICK_MS,
        };
        self.record_at(now, tick_ms, throughput, memory_used_fraction)
    }

    // RECORD A SAMPLE WHOSE TIMING WAS MEASURED BY THE HOST
    pub fn record_at(
        &mut self,
        timestamp_ns: u64,
        tick_duration_ms: f64,
        throughput: f64,
        memory_used_fraction: f64,
    ) -> TickSample {
        let sample = TickSample {
            timestamp_ns,
            tick_duration_ms,
            throughput,
            memory_used_fraction: memory_used_fraction.clamp(0.0, 1.0),
        };
        let cap = self.capacity();
        self.samples[self.head] = sample;
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
        self.last_boundary_ns = Some(timestamp_ns);
        sample
    }

    pub fn latest(&self) -> Option<&TickSample> {
        if self.len == 0 {
            return None;
        }
        let cap = self.capacity();
        Some(&self.samples[(self.head + cap - 1) % cap])
    }

    // ITERATE SAMPLES OLDEST FIRST
    pub fn iter_chronological(&self) -> impl Iterator<Item = &TickSample> {
        let cap = self.capacity();
        let start = if self.len < cap { 0 } else { self.head };
        (0..self.len).map(move |i| &self.samples[(start + i) % cap])
    }

    // SAMPLES STAMPED INSIDE [start, end]
    pub fn iter_between(&self, start_ns: u64, end_ns: u64) -> impl Iterator<Item = &TickSample> {
        self.iter_chronological()
            .filter(move |s| s.timestamp_ns >= start_ns && s.timestamp_ns <= end_ns)
    }

    pub fn mean_tick_ms(&self) -> Option<f64> {
        crate::tuning::simple_average(self.iter_chronological().map(|s| s.tick_duration_ms))
    }

    // DUMP THE RETAINED TIME SERIES
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let first = match iter.next() {
            Some(s) => s,
            None => return,
        };
        let base_ts = first.timestamp_ns;

        println!("\n{:<10} {:<10} {:<8} {:<8}", "TIME_S", "TICK_MS", "TPS", "MEM%");
        println!("{}", "-".repeat(40));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_s = s.timestamp_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            println!("{:<10.2} {:<10.2} {:<8.2} {:<8.1}",
                elapsed_s, s.tick_duration_ms, s.throughput, s.memory_used_fraction * 100.0);
        }

        if self.len == self.capacity() {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SAMPLES)", self.len);
        }
        println!("TOTAL SAMPLES: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self, spike_threshold_ms: f64) {
        if self.len < 2 {
            return;
        }

        let avg_tick = self.mean_tick_ms().unwrap_or(0.0);
        let avg_tps = crate::tuning::simple_average(
            self.iter_chronological().map(|s| s.throughput),
        ).unwrap_or(0.0);
        let peak_tick = self.iter_chronological()
            .map(|s| s.tick_duration_ms)
            .fold(0.0f64, f64::max);
        let over = self.iter_chronological()
            .filter(|s| s.tick_duration_ms > spike_threshold_ms)
            .count();

        println!("\n{}", "=".repeat(50));
        println!("TICKGOV SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  AVG TICK:          {:.2}ms", avg_tick);
        println!("  PEAK TICK:         {:.2}ms", peak_tick);
        println!("  AVG TPS:           {:.2}", avg_tps);
        println!("  OVER THRESHOLD:    {} ({:.1}%)", over, over as f64 / self.len as f64 * 100.0);
        println!("  SAMPLES:           {}", self.len);
    }
}

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_stores_sample() {
        let mut s = TickSampler::new(8);
        assert!(s.latest().is_none());

        s.record_at(1_000, 52.0, 19.2, 0.4);
        assert_eq!(s.len(), 1);
        let latest = s.latest().unwrap();
        assert_eq!(latest.timestamp_ns, 1_000);
        assert_eq!(latest.tick_duration_ms, 52.0);
        assert_eq!(latest.throughput, 19.2);
        assert_eq!(latest.memory_used_fraction, 0.4);
    }

    #[test]
    fn first_real_tick_counts_as_nominal() {
        let mut s = TickSampler::new(8);
        let first = s.record(20.0, 0.1);
        assert_eq!(first.tick_duration_ms, NOMINAL_TICK_MS);
        assert!(first.timestamp_ns > 0);
        let second = s.record(20.0, 0.1);
        assert!(second.timestamp_ns >= first.timestamp_ns);
        assert!(second.tick_duration_ms >= 0.0);
    }

    #[test]
    fn ring_buffer_wraps() {
        let mut s = TickSampler::new(4);
        for i in 0..4u64 {
            s.record_at(i, i as f64, 20.0, 0.0);
        }
        assert_eq!(s.len(), 4);
        assert_eq!(s.head, 0);

        // OVERWRITES OLDEST
        s.record_at(99, 99.0, 20.0, 0.0);
        assert_eq!(s.len(), 4);
        assert_eq!(s.head, 1);

        let ordered: Vec<u64> = s.iter_chronological().map(|x| x.timestamp_ns).collect();
        assert_eq!(ordered, vec![1, 2, 3, 99]);
        assert_eq!(s.latest().unwrap().timestamp_ns, 99);
    }

    #[test]
    fn between_uses_inclusive_window() {
        let mut s = TickSampler::new(16);
        s.record_at(10, 50.0, 20.0, 0.0);
        s.record_at(20, 120.0, 10.0, 0.0);
        s.record_at(30, 140.0, 9.0, 0.0);
        s.record_at(40, 60.0, 18.0, 0.0);

        let inside: Vec<f64> = s.iter_between(20, 40).map(|x| x.tick_duration_ms).collect();
        assert_eq!(inside, vec![120.0, 140.0, 60.0]);
        assert_eq!(s.iter_between(41, 50).count(), 0);
    }

    #[test]
    fn memory_fraction_clamped() {
        let mut s = TickSampler::new(2);
        assert_eq!(s.record_at(1, 50.0, 20.0, 1.7).memory_used_fraction, 1.0);
        assert_eq!(s.record_at(2, 50.0, 20.0, -0.2).memory_used_fraction, 0.0);
    }

    #[test]
    fn summary_and_dump_no_panic() {
        let mut s = TickSampler::new(4);
        s.summary(100.0);
        s.dump();
        s.record_at(1, 40.0, 20.0, 0.2);
        s.summary(100.0);
        s.record_at(2_000_000, 140.0, 12.0, 0.3);
        s.summary(100.0);
        s.dump();
    }
}
