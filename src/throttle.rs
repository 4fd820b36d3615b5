//! Process-wide call budget shared by every remote-call worker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::RarityError;

pub const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// Call attempts admitted per rolling one-second window.
    pub qps: u32,
    /// Attempts allowed to hold a connection at once.
    pub concurrency: usize,
}

impl RateLimits {
    pub fn new(qps: u32, concurrency: usize) -> Result<Self, RarityError> {
        if qps == 0 || concurrency == 0 {
            return Err(RarityError::InvalidConfig(
                "qps and concurrency must both be at least 1".to_string(),
            ));
        }
        Ok(Self { qps, concurrency })
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            qps: 40,
            concurrency: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetStats {
    pub issued: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct BudgetState {
    issued_at: VecDeque<Instant>,
    issued: u64,
    in_flight: usize,
    peak_in_flight: usize,
    cancelled: bool,
    deadline: Option<Instant>,
}

/// Rolling-window rate gate plus in-flight admission limiter. Waiters park on
/// a single condition variable; they wake when a slot is released, when the
/// oldest issued call leaves the window, or when the run is cancelled.
#[derive(Debug)]
pub struct RateBudget {
    limits: RateLimits,
    state: Mutex<BudgetState>,
    changed: Condvar,
}

/// Held while an attempt owns a connection; releases its slot on drop.
#[must_use]
pub struct Admission<'a> {
    budget: &'a RateBudget,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let mut state = self.budget.lock();
        state.in_flight -= 1;
        drop(state);
        self.budget.changed.notify_all();
    }
}

impl RateBudget {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState::default()),
            changed: Condvar::new(),
        }
    }

    /// Blocks until fewer than `concurrency` attempts are in flight.
    pub fn admit(&self) -> Result<Admission<'_>, RarityError> {
        let mut state = self.lock();
        loop {
            Self::check_cancelled(&mut state)?;
            if state.in_flight < self.limits.concurrency {
                state.in_flight += 1;
                state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
                return Ok(Admission { budget: self });
            }
            state = self.wait(state, None);
        }
    }

    /// Blocks until the rolling window has room, then records one issued call.
    pub fn acquire_slot(&self) -> Result<(), RarityError> {
        let mut state = self.lock();
        loop {
            Self::check_cancelled(&mut state)?;
            let now = Instant::now();
            while state
                .issued_at
                .front()
                .is_some_and(|issued| now.duration_since(*issued) >= WINDOW)
            {
                state.issued_at.pop_front();
            }
            if state.issued_at.len() < self.limits.qps as usize {
                state.issued_at.push_back(now);
                state.issued += 1;
                return Ok(());
            }
            let frees_at = state.issued_at.front().map(|issued| *issued + WINDOW);
            state = self.wait(state, frees_at);
        }
    }

    /// Sleeps for `duration` unless the run is cancelled first.
    pub fn pause(&self, duration: Duration) -> Result<(), RarityError> {
        let until = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            Self::check_cancelled(&mut state)?;
            if Instant::now() >= until {
                return Ok(());
            }
            state = self.wait(state, Some(until));
        }
    }

    /// Cancels the run at `deadline`; waiters observe it without extra wakeups.
    pub fn set_deadline(&self, deadline: Instant) {
        self.lock().deadline = Some(deadline);
        self.changed.notify_all();
    }

    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let mut state = self.lock();
        Self::check_cancelled(&mut state).is_err()
    }

    pub fn stats(&self) -> BudgetStats {
        let state = self.lock();
        BudgetStats {
            issued: state.issued,
            in_flight: state.in_flight,
            peak_in_flight: state.peak_in_flight,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_cancelled(state: &mut BudgetState) -> Result<(), RarityError> {
        if !state.cancelled && state.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            state.cancelled = true;
        }
        if state.cancelled {
            return Err(RarityError::Cancelled);
        }
        Ok(())
    }

    fn wait<'a>(
        &self,
        state: MutexGuard<'a, BudgetState>,
        until: Option<Instant>,
    ) -> MutexGuard<'a, BudgetState> {
        let wake_at = match (until, state.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match wake_at {
            Some(at) => {
                let timeout = at.saturating_duration_since(Instant::now());
                self.changed
                    .wait_timeout(state, timeout)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0)
            }
            None => self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_releases_on_drop() {
        let budget = RateBudget::new(RateLimits::new(10, 1).unwrap());
        {
            let _slot = budget.admit().unwrap();
            assert_eq!(budget.stats().in_flight, 1);
        }
        assert_eq!(budget.stats().in_flight, 0);
        let _again = budget.admit().unwrap();
    }

    #[test]
    fn cancel_wakes_paused_caller() {
        let budget = RateBudget::new(RateLimits::default());
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| budget.pause(Duration::from_secs(30)));
            std::thread::sleep(Duration::from_millis(20));
            budget.cancel();
            assert!(matches!(waiter.join().unwrap(), Err(RarityError::Cancelled)));
        });
    }

    #[test]
    fn passed_deadline_cancels() {
        let budget = RateBudget::new(RateLimits::default());
        budget.set_deadline(Instant::now());
        assert!(matches!(budget.acquire_slot(), Err(RarityError::Cancelled)));
        assert!(budget.is_cancelled());
    }

    #[test]
    fn zero_limits_rejected() {
        assert!(RateLimits::new(0, 4).is_err());
        assert!(RateLimits::new(4, 0).is_err());
    }
}
