// TICKGOV -- ADAPTIVE TICK-BUDGET GOVERNOR
// BUDGETED TASK SCHEDULING, LAG SPIKE DETECTION, OPTIMIZATION PROFILES AND
// SLOW THRESHOLD TUNING FOR A FIXED-RATE SIMULATION LOOP.
//
// tuning.rs HOLDS EVERY CONSTANT AND CONTROL LAW (NO THREADS, NO CLOCKS).
// THE REST ARE STATEFUL COMPONENTS BUILT ON IT; governor.rs WIRES THEM PER TICK.

pub mod budget;
pub mod config;
pub mod governor;
pub mod profile;
pub mod sampler;
pub mod spike;
pub mod tuner;
pub mod tuning;

pub use budget::{BudgetScheduler, Priority, ScheduleHandle};
pub use config::GovernorConfig;
pub use governor::{Governor, TickOutcome};
pub use profile::{ProfileController, ProfileHandle};
pub use spike::{LogMitigator, Mitigator, SpikeDetector};
pub use tuner::{ThresholdTuner, ThresholdsHandle};
