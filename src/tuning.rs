// TICKGOV TUNING TYPES
// PURE-RUST MODULE: NO THREADS, NO CLOCKS, NO LOGGING
// EVERY CONTROL LAW THE GOVERNOR APPLIES LIVES HERE SO IT CAN BE TESTED OFFLINE

use std::fmt;
use std::str::FromStr;

use anyhow::bail;

// --- HOST TIMING ---

pub const NOMINAL_TPS: f64     = 20.0;
pub const NOMINAL_TICK_MS: f64 = 50.0;
pub const DANGEROUS_TPS: f64   = 10.0;   // EMERGENCY WARNING FLOOR

// --- TICK BUDGET ---
// THREE WATER MARKS. ABOVE HIGH: GROW SLOWLY. BELOW MID: SHRINK SLOWLY.
// BELOW LOW: SHRINK FAST. EACH SHRINK HAS ITS OWN FLOOR.

pub const DEFAULT_MAX_TICK_BUDGET_MS: f64 = 40.0;   // 10MS HEADROOM UNDER A 50MS TICK
pub const BUDGET_HIGH_TPS: f64    = 19.5;
pub const BUDGET_MID_TPS: f64     = 19.0;
pub const BUDGET_LOW_TPS: f64     = 18.0;
pub const BUDGET_STEP_UP_MS: f64  = 0.5;
pub const BUDGET_STEP_MID_MS: f64 = 0.5;
pub const BUDGET_STEP_LOW_MS: f64 = 1.0;
pub const BUDGET_MID_FLOOR_MS: f64 = 30.0;
pub const BUDGET_FLOOR_MS: f64     = 20.0;

pub const GENERAL_CATEGORY: &str = "general";
pub const DEFAULT_TASK_ESTIMATE_MS: f64 = 1.0;

pub const DEFAULT_CATEGORIES: [(&str, f64); 6] = [
    ("entity_processing", 15.0),
    ("chunk_processing", 10.0),
    ("redstone_processing", 8.0),
    ("ai_processing", 10.0),
    ("physics_processing", 7.0),
    (GENERAL_CATEGORY, 10.0),
];

// ONE BUDGET STEP FROM THE LATEST THROUGHPUT. A SHRINK NEVER RAISES THE
// BUDGET: IF IT ALREADY SITS BELOW THE FLOOR IT STAYS WHERE IT IS.
pub fn adjust_tick_budget(current_ms: f64, max_ms: f64, tps: f64) -> f64 {
    if tps >= BUDGET_HIGH_TPS {
        (current_ms + BUDGET_STEP_UP_MS).min(max_ms)
    } else if tps < BUDGET_LOW_TPS {
        step_down(current_ms, BUDGET_STEP_LOW_MS, BUDGET_FLOOR_MS)
    } else if tps < BUDGET_MID_TPS {
        step_down(current_ms, BUDGET_STEP_MID_MS, BUDGET_MID_FLOOR_MS)
    } else {
        current_ms
    }
}

fn step_down(current_ms: f64, step: f64, floor: f64) -> f64 {
    (current_ms - step).max(floor).min(current_ms)
}

// --- LAG SPIKES ---

pub const SPIKE_THRESHOLD_MS: f64 = 100.0;   // 2X NOMINAL TICK
pub const SEVERE_THRESHOLD_MS: f64 = 200.0;  // 4X NOMINAL TICK
pub const SPIKE_CONSECUTIVE_TICKS: u32 = 3;
pub const SPIKE_HISTORY_CAPACITY: usize = 256;
pub const SAMPLE_HISTORY_CAPACITY: usize = 600; // 30S AT 20 TPS

pub const CAUSE_MEMORY_FRACTION: f64 = 0.90;
pub const CAUSE_ENTITY_CEILING: u64  = 10_000;
pub const CAUSE_REGION_CEILING: u64  = 5_000;
pub const CAUSE_SESSION_CEILING: u64 = 100;

// COARSE HOST COUNTERS SUPPLIED BY THE EMBEDDING LOOP
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemCounters {
    pub entity_count: u64,
    pub loaded_regions: u64,
    pub sessions: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CauseCeilings {
    pub memory_fraction: f64,
    pub entities: u64,
    pub regions: u64,
    pub sessions: u64,
}

impl Default for CauseCeilings {
    fn default() -> Self {
        Self {
            memory_fraction: CAUSE_MEMORY_FRACTION,
            entities: CAUSE_ENTITY_CEILING,
            regions: CAUSE_REGION_CEILING,
            sessions: CAUSE_SESSION_CEILING,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LagCause {
    HighMemory(f64),
    HighEntityCount(u64),
    HighRegionCount(u64),
    HighSessionCount(u64),
    Unknown,
}

impl fmt::Display for LagCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighMemory(frac) => write!(f, "High memory usage ({:.1}%)", frac * 100.0),
            Self::HighEntityCount(n) => write!(f, "High entity count ({})", n),
            Self::HighRegionCount(n) => write!(f, "High chunk count ({})", n),
            Self::HighSessionCount(n) => write!(f, "High player count ({})", n),
            Self::Unknown => write!(f, "Unknown (external or unclassified)"),
        }
    }
}

// FIXED PRIORITY ORDER. FIRST CEILING EXCEEDED WINS.
pub fn classify_cause(
    counters: &SystemCounters,
    memory_fraction: f64,
    ceilings: &CauseCeilings,
) -> LagCause {
    if memory_fraction > ceilings.memory_fraction {
        LagCause::HighMemory(memory_fraction)
    } else if counters.entity_count > ceilings.entities {
        LagCause::HighEntityCount(counters.entity_count)
    } else if counters.loaded_regions > ceilings.regions {
        LagCause::HighRegionCount(counters.loaded_regions)
    } else if counters.sessions > ceilings.sessions {
        LagCause::HighSessionCount(counters.sessions)
    } else {
        LagCause::Unknown
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MitigationTier {
    Normal,
    Severe,
}

impl MitigationTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Severe => "SEVERE",
        }
    }
}

pub fn mitigation_tier(peak_tick_ms: f64, severe_threshold_ms: f64) -> MitigationTier {
    if peak_tick_ms >= severe_threshold_ms {
        MitigationTier::Severe
    } else {
        MitigationTier::Normal
    }
}

// --- OPTIMIZATION PROFILES ---

pub const MEMORY_ESCALATION_FRACTION: f64 = 0.80;
pub const CONTROL_INTERVAL_TICKS: u64 = 100;   // 5S AT 20 TPS

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Profile {
    Light = 0,
    Normal = 1,
    Aggressive = 2,
    Emergency = 3,
}

impl Profile {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Light,
            1 => Self::Normal,
            2 => Self::Aggressive,
            _ => Self::Emergency,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Light => "LIGHT",
            Self::Normal => "NORMAL",
            Self::Aggressive => "AGGRESSIVE",
            Self::Emergency => "EMERGENCY",
        }
    }

    // MEMORY PRESSURE BUMPS ONE LEVEL, BUT ONLY OUT OF THE TWO MILD PROFILES
    pub fn escalate(self) -> Self {
        match self {
            Self::Light => Self::Normal,
            Self::Normal => Self::Aggressive,
            other => other,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "normal" => Ok(Self::Normal),
            "aggressive" => Ok(Self::Aggressive),
            "emergency" => Ok(Self::Emergency),
            other => bail!("unknown optimization profile '{}'", other),
        }
    }
}

pub fn profile_for_tps(t: &AdaptiveThresholds, tps: f64) -> Profile {
    if tps > t.tps_light {
        Profile::Light
    } else if tps > t.tps_normal {
        Profile::Normal
    } else if tps > t.tps_aggressive {
        Profile::Aggressive
    } else {
        Profile::Emergency
    }
}

pub fn select_profile(
    t: &AdaptiveThresholds,
    tps: f64,
    memory_fraction: f64,
    memory_escalation_fraction: f64,
) -> Profile {
    let base = profile_for_tps(t, tps);
    if memory_fraction > memory_escalation_fraction {
        base.escalate()
    } else {
        base
    }
}

// PER-PROFILE INTENSITY BUNDLE. CONSUMERS POLL THIS AND BRANCH THEIR OWN WORK.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileDirectives {
    pub entity_cleanup_interval_ticks: u32,
    pub hibernate_radius_regions: u32,
    pub view_distance_scale: f64,
    pub item_merge_radius: f64,
    pub pause_non_critical: bool,
}

pub fn profile_directives(p: Profile) -> ProfileDirectives {
    match p {
        Profile::Light => ProfileDirectives {
            entity_cleanup_interval_ticks: 6_000,   // 5 MIN
            hibernate_radius_regions: 8,
            view_distance_scale: 1.0,
            item_merge_radius: 1.5,
            pause_non_critical: false,
        },
        Profile::Normal => ProfileDirectives {
            entity_cleanup_interval_ticks: 2_400,   // 2 MIN
            hibernate_radius_regions: 6,
            view_distance_scale: 1.0,
            item_merge_radius: 2.5,
            pause_non_critical: false,
        },
        Profile::Aggressive => ProfileDirectives {
            entity_cleanup_interval_ticks: 1_200,   // 1 MIN
            hibernate_radius_regions: 4,
            view_distance_scale: 0.75,
            item_merge_radius: 3.5,
            pause_non_critical: false,
        },
        Profile::Emergency => ProfileDirectives {
            entity_cleanup_interval_ticks: 600,     // 30 S
            hibernate_radius_regions: 2,
            view_distance_scale: 0.5,
            item_merge_radius: 5.0,
            pause_non_critical: true,
        },
    }
}

// --- ADAPTIVE THRESHOLDS ---

pub const DEFAULT_TPS_LIGHT: f64      = 19.5;
pub const DEFAULT_TPS_NORMAL: f64     = 18.0;
pub const DEFAULT_TPS_AGGRESSIVE: f64 = 16.0;
pub const DEFAULT_PASSIVE_LIMIT: u32  = 200;
pub const DEFAULT_HOSTILE_LIMIT: u32  = 150;
pub const DEFAULT_ITEM_LIMIT: u32     = 1_000;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveThresholds {
    pub tps_light: f64,
    pub tps_normal: f64,
    pub tps_aggressive: f64,
    pub passive_limit: u32,
    pub hostile_limit: u32,
    pub item_limit: u32,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            tps_light: DEFAULT_TPS_LIGHT,
            tps_normal: DEFAULT_TPS_NORMAL,
            tps_aggressive: DEFAULT_TPS_AGGRESSIVE,
            passive_limit: DEFAULT_PASSIVE_LIMIT,
            hostile_limit: DEFAULT_HOSTILE_LIMIT,
            item_limit: DEFAULT_ITEM_LIMIT,
        }
    }
}

impl AdaptiveThresholds {
    pub fn is_ordered(&self, min_gap: f64) -> bool {
        self.tps_light - self.tps_normal >= min_gap
            && self.tps_normal - self.tps_aggressive >= min_gap
    }
}

// --- THRESHOLD TUNING ---

pub const TUNE_INTERVAL_SECS: u64 = 900;     // 15 MIN
pub const HISTORY_WINDOW: usize = 60;
pub const DEFAULT_MIN_GAP: f64 = 0.5;
pub const EWMA_ALPHA: f64 = 0.3;

// HEADROOM: NUDGE UP (OPTIMIZE SOONER). STRUGGLING: NUDGE DOWN.
pub const TUNE_HIGH_TPS: f64 = 19.5;
pub const TUNE_LOW_TPS: f64  = 17.0;

pub const LIGHT_STEP_UP: f64      = 0.1;
pub const NORMAL_STEP_UP: f64     = 0.2;
pub const AGGRESSIVE_STEP_UP: f64 = 0.2;
pub const LIGHT_UP_CAP: f64       = 19.7;   // A HOST HOLDING 19.8 STAYS LIGHT
pub const NORMAL_UP_CAP: f64      = 18.5;
pub const AGGRESSIVE_UP_CAP: f64  = 16.5;

pub const LIGHT_STEP_DOWN: f64      = 0.2;
pub const NORMAL_STEP_DOWN: f64     = 0.3;
pub const AGGRESSIVE_STEP_DOWN: f64 = 0.5;
pub const LIGHT_DOWN_FLOOR: f64     = 19.0;
pub const NORMAL_DOWN_FLOOR: f64    = 16.5;
pub const AGGRESSIVE_DOWN_FLOOR: f64 = 14.0;

// ABSOLUTE BOUNDS, APPLIED AFTER EVERY NUDGE
pub const LIGHT_BOUNDS: (f64, f64)      = (18.0, 20.0);
pub const NORMAL_BOUNDS: (f64, f64)     = (10.0, 19.0);
pub const AGGRESSIVE_BOUNDS: (f64, f64) = (5.0, 18.0);

// STEP TOWARD A CAP WITHOUT EVER CROSSING BACK OVER A VALUE ALREADY PAST IT
fn nudge_up(v: f64, step: f64, cap: f64) -> f64 {
    if v >= cap { v } else { (v + step).min(cap) }
}

fn nudge_down(v: f64, step: f64, floor: f64) -> f64 {
    if v <= floor { v } else { (v - step).max(floor) }
}

// LIGHT > NORMAL > AGGRESSIVE WITH AT LEAST min_gap BETWEEN NEIGHBOURS.
// ONLY EVER PULLS THE LOWER THRESHOLD DOWN.
pub fn enforce_threshold_order(mut t: AdaptiveThresholds, min_gap: f64) -> AdaptiveThresholds {
    if t.tps_normal > t.tps_light - min_gap {
        t.tps_normal = t.tps_light - min_gap;
    }
    if t.tps_aggressive > t.tps_normal - min_gap {
        t.tps_aggressive = t.tps_normal - min_gap;
    }
    t
}

pub fn nudge_tps_thresholds(
    mut t: AdaptiveThresholds,
    avg_tps: f64,
    min_gap: f64,
) -> AdaptiveThresholds {
    if avg_tps > TUNE_HIGH_TPS {
        t.tps_light = nudge_up(t.tps_light, LIGHT_STEP_UP, LIGHT_UP_CAP);
        t.tps_normal = nudge_up(t.tps_normal, NORMAL_STEP_UP, NORMAL_UP_CAP);
        t.tps_aggressive = nudge_up(t.tps_aggressive, AGGRESSIVE_STEP_UP, AGGRESSIVE_UP_CAP);
    } else if avg_tps < TUNE_LOW_TPS {
        t.tps_light = nudge_down(t.tps_light, LIGHT_STEP_DOWN, LIGHT_DOWN_FLOOR);
        t.tps_normal = nudge_down(t.tps_normal, NORMAL_STEP_DOWN, NORMAL_DOWN_FLOOR);
        t.tps_aggressive = nudge_down(t.tps_aggressive, AGGRESSIVE_STEP_DOWN, AGGRESSIVE_DOWN_FLOOR);
    }

    t.tps_light = t.tps_light.clamp(LIGHT_BOUNDS.0, LIGHT_BOUNDS.1);
    t.tps_normal = t.tps_normal.clamp(NORMAL_BOUNDS.0, NORMAL_BOUNDS.1);
    t.tps_aggressive = t.tps_aggressive.clamp(AGGRESSIVE_BOUNDS.0, AGGRESSIVE_BOUNDS.1);

    enforce_threshold_order(t, min_gap)
}

// --- ENTITY LIMITS ---

pub const MEMORY_HIGH_AVG: f64 = 0.75;
pub const MEMORY_LOW_AVG: f64  = 0.50;
pub const GROW_MIN_TPS: f64    = 19.0;

pub const PASSIVE_SHRINK: f64 = 0.90;
pub const HOSTILE_SHRINK: f64 = 0.90;
pub const ITEM_SHRINK: f64    = 0.85;
pub const PASSIVE_GROW: f64   = 1.10;
pub const HOSTILE_GROW: f64   = 1.10;
pub const ITEM_GROW: f64      = 1.15;

pub const PASSIVE_FLOOR: u32 = 50;
pub const HOSTILE_FLOOR: u32 = 50;
pub const ITEM_FLOOR: u32    = 200;
pub const PASSIVE_CAP: u32   = 500;
pub const HOSTILE_CAP: u32   = 400;
pub const ITEM_CAP: u32      = 2_000;

// MULTIPLICATIVE, TRUNCATING. A SHRINK NEVER GROWS A LIMIT ALREADY UNDER ITS
// FLOOR AND A GROW NEVER SHRINKS A LIMIT ALREADY OVER ITS CAP.
fn shrink(limit: u32, factor: f64, floor: u32) -> u32 {
    ((limit as f64 * factor) as u32).max(floor).min(limit)
}

fn grow(limit: u32, factor: f64, cap: u32) -> u32 {
    ((limit as f64 * factor) as u32).min(cap).max(limit)
}

pub fn adapt_entity_limits(
    mut t: AdaptiveThresholds,
    avg_memory_fraction: f64,
    avg_tps: f64,
) -> AdaptiveThresholds {
    if avg_memory_fraction > MEMORY_HIGH_AVG {
        t.passive_limit = shrink(t.passive_limit, PASSIVE_SHRINK, PASSIVE_FLOOR);
        t.hostile_limit = shrink(t.hostile_limit, HOSTILE_SHRINK, HOSTILE_FLOOR);
        t.item_limit = shrink(t.item_limit, ITEM_SHRINK, ITEM_FLOOR);
    } else if avg_memory_fraction < MEMORY_LOW_AVG && avg_tps > GROW_MIN_TPS {
        t.passive_limit = grow(t.passive_limit, PASSIVE_GROW, PASSIVE_CAP);
        t.hostile_limit = grow(t.hostile_limit, HOSTILE_GROW, HOSTILE_CAP);
        t.item_limit = grow(t.item_limit, ITEM_GROW, ITEM_CAP);
    }
    t
}

// --- SMOOTHING ---

pub fn simple_average<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

// SEEDED WITH THE OLDEST VALUE, THEN alpha * NEW + (1 - alpha) * OLD
pub fn ewma<I: IntoIterator<Item = f64>>(values: I, alpha: f64) -> Option<f64> {
    let mut iter = values.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |acc, v| alpha * v + (1.0 - alpha) * acc))
}

// --- TELEMETRY GATING ---

pub fn should_print_telemetry(cycle: u64, stable: bool) -> bool {
    if stable {
        cycle % 2 == 0
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nudge_up_leaves_values_above_cap() {
        assert_eq!(nudge_up(19.9, 0.1, 19.8), 19.9);
        assert_eq!(nudge_up(19.75, 0.1, 19.8), 19.8);
    }

    #[test]
    fn nudge_down_leaves_values_below_floor() {
        assert_eq!(nudge_down(18.5, 0.2, 19.0), 18.5);
        assert_eq!(nudge_down(19.1, 0.2, 19.0), 19.0);
    }

    #[test]
    fn shrink_never_grows_below_floor_limit() {
        // CONFIGURED BELOW THE FLOOR: SHRINK IS A NO-OP, NOT A JUMP UP
        assert_eq!(shrink(30, 0.9, 50), 30);
        assert_eq!(shrink(200, 0.9, 50), 180);
    }

    #[test]
    fn grow_never_shrinks_above_cap_limit() {
        assert_eq!(grow(600, 1.1, 500), 600);
        assert_eq!(grow(200, 1.1, 500), 220);
    }

    #[test]
    fn step_down_never_raises() {
        assert_eq!(step_down(25.0, 0.5, 30.0), 25.0);
        assert_eq!(step_down(35.0, 0.5, 30.0), 34.5);
    }
}
