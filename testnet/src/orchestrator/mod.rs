// File: testnet/src/orchestrator/mod.rs
//
// Orchestrator Module
//
// Time control shared by every deadline-bounded loop in the controller: the
// Clock seam and the single poll/sleep/recheck primitive built on it.

/// Clock abstractions for deterministic time control in tests
pub mod clock;
/// Deadline-bounded polling
pub mod poll;

pub use clock::{Clock, PausedClock, SystemClock};
pub use poll::{poll_until, PollSchedule, PollTimeout, Probe};
