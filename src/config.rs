// TICKGOV CONFIGURATION
// DEFAULTS COME FROM tuning.rs. THE BINARY MAPS CLI FLAGS ONTO THESE STRUCTS,
// VALIDATES ONCE AT STARTUP, AND THE PER-TICK PATH NEVER FAILS AFTER THAT.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::tuner::Smoothing;
use crate::tuning::{self, AdaptiveThresholds, CauseCeilings, Profile};

#[derive(Clone, Debug)]
pub struct BudgetConfig {
    pub max_budget_ms: f64,
    pub categories: Vec<(String, f64)>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_budget_ms: tuning::DEFAULT_MAX_TICK_BUDGET_MS,
            categories: tuning::DEFAULT_CATEGORIES
                .iter()
                .map(|(name, limit)| (name.to_string(), *limit))
                .collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpikeConfig {
    pub spike_threshold_ms: f64,
    pub severe_threshold_ms: f64,
    pub consecutive_ticks: u32,
    pub history_capacity: usize,
    pub mitigation_queue: usize,
    pub ceilings: CauseCeilings,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            spike_threshold_ms: tuning::SPIKE_THRESHOLD_MS,
            severe_threshold_ms: tuning::SEVERE_THRESHOLD_MS,
            consecutive_ticks: tuning::SPIKE_CONSECUTIVE_TICKS,
            history_capacity: tuning::SPIKE_HISTORY_CAPACITY,
            mitigation_queue: 16,
            ceilings: CauseCeilings::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProfileConfig {
    // NONE = START IN AUTO
    pub initial: Option<Profile>,
    pub memory_escalation_fraction: f64,
    pub dangerous_tps: f64,
    pub change_history: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            initial: None,
            memory_escalation_fraction: tuning::MEMORY_ESCALATION_FRACTION,
            dangerous_tps: tuning::DANGEROUS_TPS,
            change_history: 32,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TunerConfig {
    pub interval: Duration,
    pub window_capacity: usize,
    pub min_gap: f64,
    pub smoothing: Smoothing,
    pub initial: AdaptiveThresholds,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(tuning::TUNE_INTERVAL_SECS),
            window_capacity: tuning::HISTORY_WINDOW,
            min_gap: tuning::DEFAULT_MIN_GAP,
            smoothing: Smoothing::Simple,
            initial: AdaptiveThresholds::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GovernorConfig {
    pub sample_capacity: usize,
    pub control_interval_ticks: u64,
    pub budget: BudgetConfig,
    pub spike: SpikeConfig,
    pub profile: ProfileConfig,
    pub tuner: TunerConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sample_capacity: tuning::SAMPLE_HISTORY_CAPACITY,
            control_interval_ticks: tuning::CONTROL_INTERVAL_TICKS,
            budget: BudgetConfig::default(),
            spike: SpikeConfig::default(),
            profile: ProfileConfig::default(),
            tuner: TunerConfig::default(),
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_capacity == 0 {
            bail!("sample capacity must be non-zero");
        }
        if self.control_interval_ticks == 0 {
            bail!("control interval must be at least one tick");
        }

        let b = &self.budget;
        if !(b.max_budget_ms > 0.0) {
            bail!("max tick budget must be positive (got {})", b.max_budget_ms);
        }
        for (name, limit) in &b.categories {
            if name.is_empty() {
                bail!("task category names must be non-empty");
            }
            if !(*limit > 0.0) {
                bail!("category '{}' budget must be positive (got {})", name, limit);
            }
        }

        let s = &self.spike;
        if !(s.spike_threshold_ms > 0.0) {
            bail!("spike threshold must be positive (got {})", s.spike_threshold_ms);
        }
        if s.severe_threshold_ms <= s.spike_threshold_ms {
            bail!(
                "severe threshold {}ms must exceed spike threshold {}ms",
                s.severe_threshold_ms, s.spike_threshold_ms
            );
        }
        if s.consecutive_ticks == 0 {
            bail!("spike detection needs at least one consecutive tick");
        }
        if s.history_capacity == 0 || s.mitigation_queue == 0 {
            bail!("spike history and mitigation queue must be non-empty");
        }

        let p = &self.profile;
        if !(0.0..=1.0).contains(&p.memory_escalation_fraction) {
            bail!(
                "memory escalation must be a fraction in [0, 1] (got {})",
                p.memory_escalation_fraction
            );
        }

        let t = &self.tuner;
        if t.interval.is_zero() {
            bail!("tuning interval must be non-zero");
        }
        if t.window_capacity == 0 {
            bail!("tuning history window must be non-empty");
        }
        if !(t.min_gap > 0.0) {
            bail!("minimum threshold gap must be positive (got {})", t.min_gap);
        }
        if !t.initial.is_ordered(t.min_gap) {
            bail!(
                "tps thresholds must satisfy light > normal > aggressive with gap {} (got {}/{}/{})",
                t.min_gap, t.initial.tps_light, t.initial.tps_normal, t.initial.tps_aggressive
            );
        }
        if let Smoothing::Ewma { alpha } = t.smoothing {
            if !(alpha > 0.0 && alpha <= 1.0) {
                bail!("ewma alpha must be in (0, 1] (got {})", alpha);
            }
        }

        Ok(())
    }
}

// "auto" OR A PROFILE LABEL
pub fn parse_initial_profile(s: &str) -> Result<Option<Profile>> {
    if s.trim().eq_ignore_ascii_case("auto") {
        Ok(None)
    } else {
        Ok(Some(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(GovernorConfig::default().validate().is_ok());
    }

    #[test]
    fn severe_must_exceed_spike_threshold() {
        let mut cfg = GovernorConfig::default();
        cfg.spike.severe_threshold_ms = cfg.spike.spike_threshold_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut cfg = GovernorConfig::default();
        cfg.tuner.initial.tps_normal = cfg.tuner.initial.tps_light;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_consecutive_ticks_rejected() {
        let mut cfg = GovernorConfig::default();
        cfg.spike.consecutive_ticks = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ewma_alpha_out_of_range_rejected() {
        let mut cfg = GovernorConfig::default();
        cfg.tuner.smoothing = Smoothing::Ewma { alpha: 1.5 };
        assert!(cfg.validate().is_err());
        cfg.tuner.smoothing = Smoothing::Ewma { alpha: 0.3 };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn initial_profile_parsing() {
        assert_eq!(parse_initial_profile("AUTO").unwrap(), None);
        assert_eq!(parse_initial_profile("aggressive").unwrap(), Some(Profile::Aggressive));
        assert!(parse_initial_profile("turbo").is_err());
    }
}
