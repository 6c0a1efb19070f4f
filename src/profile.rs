// TICKGOV PROFILE CONTROLLER
// FOUR-STATE INTENSITY MACHINE PLUS AN AUTO META-MODE. THE CURRENT PROFILE IS
// PUBLISHED THROUGH AN AtomicU8 SO CONSUMERS ON ANY THREAD CAN POLL IT.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::ProfileConfig;
use crate::tuner::ThresholdsHandle;
use crate::tuning::{self, Profile, ProfileDirectives};

// SINGLE WRITER (THE CONTROLLER), ANY NUMBER OF READERS
#[derive(Clone)]
pub struct ProfileHandle(Arc<AtomicU8>);

impl ProfileHandle {
    fn new(p: Profile) -> Self {
        Self(Arc::new(AtomicU8::new(p as u8)))
    }

    pub fn current(&self) -> Profile {
        Profile::from_u8(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, p: Profile) {
        self.0.store(p as u8, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChangeReason {
    Auto { tps: f64, memory_fraction: f64 },
    Manual,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto { tps, memory_fraction } => {
                write!(f, "AUTO (TPS {:.2}, MEM {:.1}%)", tps, memory_fraction * 100.0)
            }
            Self::Manual => f.write_str("MANUAL"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileChange {
    pub from: Profile,
    pub to: Profile,
    pub reason: ChangeReason,
}

pub type ProfileListener = Box<dyn FnMut(&ProfileChange) + Send>;

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileStats {
    pub current: Profile,
    pub mode: Mode,
    pub evaluations: u64,
    pub transitions: u64,
    pub recent_changes: Vec<ProfileChange>,
}

pub struct ProfileController {
    handle: ProfileHandle,
    thresholds: ThresholdsHandle,
    mode: Mode,
    memory_escalation_fraction: f64,
    dangerous_tps: f64,
    last_inputs: Option<(f64, f64)>,
    listeners: Vec<ProfileListener>,
    recent: VecDeque<ProfileChange>,
    recent_capacity: usize,
    evaluations: u64,
    transitions: u64,
}

impl ProfileController {
    pub fn new(config: &ProfileConfig, thresholds: ThresholdsHandle) -> Self {
        let (initial, mode) = match config.initial {
            Some(p) => (p, Mode::Manual),
            None => (Profile::Normal, Mode::Auto),
        };
        Self {
            handle: ProfileHandle::new(initial),
            thresholds,
            mode,
            memory_escalation_fraction: config.memory_escalation_fraction,
            dangerous_tps: config.dangerous_tps,
            last_inputs: None,
            listeners: Vec::new(),
            recent: VecDeque::with_capacity(config.change_history.max(1)),
            recent_capacity: config.change_history.max(1),
            evaluations: 0,
            transitions: 0,
        }
    }

    pub fn current_profile(&self) -> Profile {
        self.handle.current()
    }

    pub fn handle(&self) -> ProfileHandle {
        self.handle.clone()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn directives(&self) -> ProfileDirectives {
        tuning::profile_directives(self.current_profile())
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&ProfileChange) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    // ONE AUTO CYCLE. MANUAL MODE: NOTHING CHANGES.
    pub fn evaluate(&mut self, tps: f64, memory_fraction: f64) -> Option<ProfileChange> {
        self.last_inputs = Some((tps, memory_fraction));
        if self.mode != Mode::Auto {
            return None;
        }
        self.evaluations += 1;

        let thresholds = self.thresholds.load();
        let next = tuning::select_profile(
            &thresholds, tps, memory_fraction, self.memory_escalation_fraction);
        let change = self.transition(next, ChangeReason::Auto { tps, memory_fraction });
        self.apply_directives(tps);
        change
    }

    // ON-DEMAND RE-EVALUATION FROM THE LAST SEEN INPUTS
    pub fn force_evaluation_cycle(&mut self) -> Option<ProfileChange> {
        let (tps, mem) = self.last_inputs?;
        self.evaluate(tps, mem)
    }

    // MANUAL OVERRIDE. LEAVES AUTO UNTIL enable_auto().
    pub fn set_profile(&mut self, p: Profile) -> Option<ProfileChange> {
        if self.mode == Mode::Auto {
            info!("PROFILE: AUTO MODE DISABLED BY MANUAL OVERRIDE");
        }
        self.mode = Mode::Manual;
        self.transition(p, ChangeReason::Manual)
    }

    pub fn enable_auto(&mut self) {
        if self.mode != Mode::Auto {
            self.mode = Mode::Auto;
            info!("PROFILE: AUTO MODE ENABLED");
        }
    }

    fn transition(&mut self, to: Profile, reason: ChangeReason) -> Option<ProfileChange> {
        let from = self.handle.current();
        if from == to {
            return None;
        }
        self.handle.set(to);
        self.transitions += 1;

        let change = ProfileChange { from, to, reason };
        info!("PROFILE: {} -> {} | {}", from, to, reason);

        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(change);
        for listener in self.listeners.iter_mut() {
            listener(&change);
        }
        Some(change)
    }

    fn apply_directives(&self, tps: f64) {
        let p = self.current_profile();
        let d = tuning::profile_directives(p);
        debug!(
            "PROFILE {} DIRECTIVES: CLEANUP={}t HIBERNATE={}r VIEW={:.2}x MERGE={:.1} PAUSE={}",
            p, d.entity_cleanup_interval_ticks, d.hibernate_radius_regions,
            d.view_distance_scale, d.item_merge_radius, d.pause_non_critical,
        );
        if p == Profile::Emergency && tps < self.dangerous_tps {
            warn!("EMERGENCY PROFILE ACTIVE AND TPS STILL DANGEROUS: {:.2} < {:.2}",
                tps, self.dangerous_tps);
        }
    }

    pub fn recent_changes(&self) -> Vec<ProfileChange> {
        self.recent.iter().copied().collect()
    }

    pub fn stats(&self) -> ProfileStats {
        ProfileStats {
            current: self.current_profile(),
            mode: self.mode,
            evaluations: self.evaluations,
            transitions: self.transitions,
            recent_changes: self.recent_changes(),
        }
    }
}
