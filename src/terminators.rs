//! Terminators for controlling and interrupting long-running solves.
//!
//! Terminators are consulted once per outer iteration, after the step has
//! been accepted. This module provides:
//! - [`NullTerminator`]: never triggers.
//! - [`InterruptTerminator`]: responds to Ctrl-C (SIGINT) or programmatic
//!   interrupts.
//! - [`TimeOutTerminator`]: terminates after a specified time limit.
//! - [`SlowProgressTerminator`]: terminates when the merit value stalls.
//! - [`MultiTerminator`]: combines multiple terminators.
//!
//! # Note
//! [`InterruptTerminator`] installs a global signal handler and **can only be
//! constructed once** per process. Attempting to create multiple instances
//! will result in a panic.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ilqr::IterationRecord;
use crate::{Status, E};

/// Criterion for deciding when the solver should stop, independent of the
/// optimality test.
///
/// Checked once per outer iteration. Returns `Some(Status)` to stop, `None`
/// to continue.
pub trait Terminator {
    /// Called once before the first iteration to reset any internal state
    /// (e.g. timers).
    fn initialize(&mut self) {}

    /// Returns `Some(status)` if the solver should stop, `None` otherwise.
    fn terminate(&mut self, record: &IterationRecord) -> Option<Status>;
}

/// A terminator that never triggers. The solver runs until convergence or
/// the iteration limit.
pub struct NullTerminator {}

impl Terminator for NullTerminator {
    fn terminate(&mut self, _record: &IterationRecord) -> Option<Status> {
        None
    }
}

/// Terminator that responds to Ctrl-C (SIGINT) or programmatic interrupts.
///
/// # Note
/// Only one instance can be constructed per process, as it installs a global
/// signal handler. Creating more than one will panic.
pub struct InterruptTerminator {
    interrupted: Arc<AtomicBool>,
}

impl InterruptTerminator {
    pub fn new() -> Self {
        let interrupted = Arc::new(AtomicBool::new(false));
        ctrlc::set_handler({
            let interrupted_clone = interrupted.clone();
            move || {
                interrupted_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .expect("Error setting Ctrl-C handler");
        Self { interrupted }
    }

    pub fn interrupt(&mut self) {
        self.interrupted
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Terminator for InterruptTerminator {
    fn terminate(&mut self, _record: &IterationRecord) -> Option<Status> {
        if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            Some(Status::Interrupted)
        } else {
            None
        }
    }
}

/// Terminator that triggers after a wall-clock limit.
pub struct TimeOutTerminator {
    limit: Duration,
    start_time: Instant,
}

impl TimeOutTerminator {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            start_time: Instant::now(),
        }
    }
}

impl Terminator for TimeOutTerminator {
    fn initialize(&mut self) {
        self.start_time = Instant::now();
    }

    fn terminate(&mut self, _record: &IterationRecord) -> Option<Status> {
        if self.start_time.elapsed() >= self.limit {
            Some(Status::TimeLimit)
        } else {
            None
        }
    }
}

/// Terminates when the merit value changes by less than `tolerance` between
/// consecutive accepted iterations.
pub struct SlowProgressTerminator {
    tolerance: E,
    prev_merit: Option<E>,
}

impl SlowProgressTerminator {
    pub fn new(tolerance: E) -> Self {
        Self {
            tolerance,
            prev_merit: None,
        }
    }
}

impl Terminator for SlowProgressTerminator {
    fn initialize(&mut self) {
        self.prev_merit = None;
    }

    fn terminate(&mut self, record: &IterationRecord) -> Option<Status> {
        let stalled = self
            .prev_merit
            .is_some_and(|prev| (record.merit - prev).abs() <= self.tolerance);
        self.prev_merit = Some(record.merit);
        if stalled { Some(Status::Optimal) } else { None }
    }
}

/// Combines multiple terminators; stops on the first one that fires.
pub struct MultiTerminator {
    terminators: Vec<Box<dyn Terminator>>,
}

impl MultiTerminator {
    pub fn new(terminators: Vec<Box<dyn Terminator>>) -> Self {
        Self { terminators }
    }

    pub fn add_terminator(&mut self, terminator: Box<dyn Terminator>) {
        self.terminators.push(terminator);
    }
}

impl Terminator for MultiTerminator {
    fn initialize(&mut self) {
        for terminator in &mut self.terminators {
            terminator.initialize();
        }
    }

    fn terminate(&mut self, record: &IterationRecord) -> Option<Status> {
        for terminator in &mut self.terminators {
            if let Some(status) = terminator.terminate(record) {
                return Some(status);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(merit: E) -> IterationRecord {
        IterationRecord {
            iter: 0,
            alpha: 1.0,
            cost: merit,
            defect_norm: 0.0,
            constraint_violation: 0.0,
            bound_violation: 0.0,
            merit,
            merit_der: 0.0,
            step_length: 0.0,
            hxx_reg: 0.0,
            rho: 1.0,
            accepted: true,
        }
    }

    #[test]
    fn timeout_fires_after_limit() {
        let mut terminator = TimeOutTerminator::new(Duration::from_millis(0));
        terminator.initialize();
        assert_eq!(terminator.terminate(&record(1.0)), Some(Status::TimeLimit));
    }

    #[test]
    fn timeout_does_not_fire_early() {
        let mut terminator = TimeOutTerminator::new(Duration::from_secs(3600));
        terminator.initialize();
        assert_eq!(terminator.terminate(&record(1.0)), None);
    }

    #[test]
    fn slow_progress_requires_two_records() {
        let mut terminator = SlowProgressTerminator::new(1e-9);
        assert_eq!(terminator.terminate(&record(1.0)), None);
        assert_eq!(terminator.terminate(&record(1.0)), Some(Status::Optimal));
    }

    #[test]
    fn multi_stops_on_first_firing_member() {
        let mut terminator = MultiTerminator::new(vec![
            Box::new(NullTerminator {}),
            Box::new(TimeOutTerminator::new(Duration::from_millis(0))),
        ]);
        terminator.initialize();
        assert_eq!(terminator.terminate(&record(1.0)), Some(Status::TimeLimit));
    }
}
