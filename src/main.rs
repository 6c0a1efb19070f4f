// TICKGOV v1.0.0 -- ADAPTIVE TICK-BUDGET GOVERNOR
// DRIVES A FIXED-RATE HOST LOOP WITH BUDGETED WORK, LAG SPIKE DETECTION,
// OPTIMIZATION PROFILES AND A BACKGROUND THRESHOLD TUNER
//
// CONTROL LAWS LIVE IN THE LIBRARY (tuning.rs). THIS BINARY HANDLES:
// CONFIGURATION, LOGGING, THE HOST LOOP, REPORTING

mod adaptive;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tickgov::config::{self, GovernorConfig};
use tickgov::spike::LogMitigator;
use tickgov::tuner::Smoothing;
use tickgov::tuning;
use tickgov::Governor;

use adaptive::{Scenario, SharedState, Workload};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "tickgov")]
#[command(about = "TICKGOV -- ADAPTIVE TICK-BUDGET GOVERNOR")]
struct Cli {
    // HOST TICK PERIOD IN MILLISECONDS (0 = RUN UNTHROTTLED)
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,

    // STOP AFTER N TICKS (DEFAULT: RUN UNTIL CTRL+C)
    #[arg(long)]
    ticks: Option<u64>,

    // SYNTHETIC HOST LOAD
    #[arg(long, value_enum, default_value_t = Scenario::Steady)]
    scenario: Scenario,

    // WORKLOAD RNG SEED
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    // CEILING FOR THE ADAPTIVE PER-TICK BUDGET
    #[arg(long, default_value_t = tuning::DEFAULT_MAX_TICK_BUDGET_MS)]
    max_budget_ms: f64,

    // TICK DURATION THAT COUNTS AS OVER THRESHOLD
    #[arg(long, default_value_t = tuning::SPIKE_THRESHOLD_MS)]
    spike_threshold_ms: f64,

    // PEAK AT OR ABOVE THIS GETS SEVERE MITIGATION
    #[arg(long, default_value_t = tuning::SEVERE_THRESHOLD_MS)]
    severe_threshold_ms: f64,

    // CONSECUTIVE OVER-THRESHOLD TICKS BEFORE A SPIKE OPENS
    #[arg(long, default_value_t = tuning::SPIKE_CONSECUTIVE_TICKS)]
    spike_ticks: u32,

    // MEMORY PERCENT THAT ESCALATES THE PROFILE ONE LEVEL
    #[arg(long, default_value_t = tuning::MEMORY_ESCALATION_FRACTION * 100.0)]
    memory_escalation_pct: f64,

    // auto | light | normal | aggressive | emergency
    #[arg(long, default_value = "auto")]
    initial_profile: String,

    // SECONDS BETWEEN TUNING CYCLES
    #[arg(long, default_value_t = tuning::TUNE_INTERVAL_SECS)]
    tune_interval_secs: u64,

    // TUNING HISTORY WINDOW (POINTS)
    #[arg(long, default_value_t = tuning::HISTORY_WINDOW)]
    history_window: usize,

    // SMOOTH TUNING INPUTS WITH AN EWMA OF THIS ALPHA INSTEAD OF A PLAIN MEAN
    #[arg(long)]
    ewma_alpha: Option<f64>,

    // TICKS BETWEEN PROFILE EVALUATIONS
    #[arg(long, default_value_t = tuning::CONTROL_INTERVAL_TICKS)]
    control_interval_ticks: u64,

    // VERBOSITY: -v DEBUG, -vv TRACE
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    // DUMP THE RETAINED TICK SAMPLES ON EXIT
    #[arg(long)]
    dump_log: bool,
}

impl Cli {
    fn governor_config(&self) -> Result<GovernorConfig> {
        let mut cfg = GovernorConfig::default();
        cfg.control_interval_ticks = self.control_interval_ticks;
        cfg.budget.max_budget_ms = self.max_budget_ms;
        cfg.spike.spike_threshold_ms = self.spike_threshold_ms;
        cfg.spike.severe_threshold_ms = self.severe_threshold_ms;
        cfg.spike.consecutive_ticks = self.spike_ticks;
        cfg.profile.memory_escalation_fraction = self.memory_escalation_pct / 100.0;
        cfg.profile.initial = config::parse_initial_profile(&self.initial_profile)
            .context("invalid --initial-profile")?;
        cfg.tuner.interval = Duration::from_secs(self.tune_interval_secs);
        cfg.tuner.window_capacity = self.history_window;
        if let Some(alpha) = self.ewma_alpha {
            cfg.tuner.smoothing = Smoothing::Ewma { alpha };
        }
        Ok(cfg)
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let cfg = cli.governor_config()?;
    let (mut gov, tuner) = Governor::init(&cfg, LogMitigator)?;

    println!("TICKGOV v1.0.0");
    println!("SCENARIO:        {:?} (seed {:#x})", cli.scenario, cli.seed);
    println!("TICK:            {}ms{}", cli.tick_ms,
             match cli.ticks { Some(n) => format!(" x {}", n), None => String::new() });
    println!("BUDGET:          {:.1}ms MAX", cfg.budget.max_budget_ms);
    println!("SPIKE:           >{:.0}ms x{} (SEVERE >={:.0}ms)",
             cfg.spike.spike_threshold_ms, cfg.spike.consecutive_ticks, cfg.spike.severe_threshold_ms);
    println!("PROFILE:         {} ({:?})", gov.profile.current_profile(), gov.profile.mode());
    println!("TUNER:           EVERY {}s, WINDOW {}, {:?}",
             cfg.tuner.interval.as_secs(), cfg.tuner.window_capacity, cfg.tuner.smoothing);
    println!();

    let shared = Arc::new(SharedState::new());
    let tuner_handle = adaptive::tuner_thread(tuner, shared.clone(), cfg.tuner.interval, &SHUTDOWN)?;

    println!("TICKGOV IS ACTIVE (CTRL+C TO EXIT)");

    let mut workload = Workload::new(cli.scenario, cli.seed);
    let res = adaptive::tick_loop(
        &mut gov,
        &mut workload,
        &shared,
        Duration::from_millis(cli.tick_ms),
        cli.ticks,
        &SHUTDOWN,
    );

    println!("TICKGOV IS SHUTTING DOWN");
    SHUTDOWN.store(true, Ordering::Relaxed);
    let tuner = tuner_handle
        .join()
        .map_err(|_| anyhow::anyhow!("tuner thread panicked"))?;
    res?;

    let ts = tuner.stats();
    println!("TUNING CYCLES:   {} (WINDOW {})", ts.cycles, ts.window_len);

    if cli.dump_log {
        gov.sampler.dump();
    }
    gov.sampler.summary(cfg.spike.spike_threshold_ms);

    gov.scheduler.stop();
    println!("TICKGOV OUT.");
    Ok(())
}
