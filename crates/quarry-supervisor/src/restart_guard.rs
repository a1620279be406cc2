//! Automatic-restart policy decisions.
//!
//! The guard is a pure decision object: the supervisor's monitor loop feeds
//! it every confirmed termination, and it answers with what to do. Time is
//! an explicit input so tests never sleep.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use quarry_process::RestartPolicy;

/// Rolling attempt window. Entries expire individually (sliding window, not
/// a fixed per-hour bucket reset).
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Reached via `stop()` or `force_stop()`.
    UserInitiated,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    NoAction,
    /// Policy outcome, not an error: the hourly attempt cap is spent.
    BudgetExhausted,
    /// Resubmit `start()` after this delay.
    RestartAfter(Duration),
}

#[derive(Debug, Default)]
pub struct RestartGuard {
    attempts: VecDeque<Instant>,
    last_attempt: Option<Instant>,
}

impl RestartGuard {
    pub fn decide(
        &mut self,
        policy: &RestartPolicy,
        termination: Termination,
        now: Instant,
    ) -> RestartDecision {
        self.expire(now);

        if !policy.enabled {
            return RestartDecision::NoAction;
        }
        if termination == Termination::UserInitiated && !policy.force_keep_alive {
            return RestartDecision::NoAction;
        }
        if !policy.unlimited_attempts()
            && self.attempts.len() >= policy.max_attempts_per_hour.max(0) as usize
        {
            return RestartDecision::BudgetExhausted;
        }

        let min_gap = Duration::from_secs(policy.min_interval_secs);
        let delay = match self.last_attempt {
            Some(prev) => min_gap.saturating_sub(now.duration_since(prev)),
            None => Duration::ZERO,
        };

        // The attempt is counted at the moment start() will be resubmitted.
        let at = now + delay;
        self.attempts.push_back(at);
        self.last_attempt = Some(at);
        RestartDecision::RestartAfter(delay)
    }

    pub fn attempts_in_window(&self) -> usize {
        self.attempts.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.attempts.front() {
            if now.saturating_duration_since(*front) > ATTEMPT_WINDOW {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: i32, interval: u64) -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            force_keep_alive: false,
            max_attempts_per_hour: max,
            min_interval_secs: interval,
        }
    }

    #[test]
    fn disabled_policy_takes_no_action() {
        let mut guard = RestartGuard::default();
        let p = RestartPolicy::default();
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, Instant::now()),
            RestartDecision::NoAction
        );
    }

    #[test]
    fn user_stop_without_keep_alive_takes_no_action() {
        let mut guard = RestartGuard::default();
        let p = policy(2, 5);
        assert_eq!(
            guard.decide(&p, Termination::UserInitiated, Instant::now()),
            RestartDecision::NoAction
        );
        assert_eq!(guard.attempts_in_window(), 0);
    }

    #[test]
    fn user_stop_with_force_keep_alive_restarts() {
        let mut guard = RestartGuard::default();
        let p = RestartPolicy {
            force_keep_alive: true,
            ..policy(2, 0)
        };
        assert_eq!(
            guard.decide(&p, Termination::UserInitiated, Instant::now()),
            RestartDecision::RestartAfter(Duration::ZERO)
        );
    }

    #[test]
    fn budget_exhausts_on_third_death_with_cap_of_two() {
        let mut guard = RestartGuard::default();
        let p = policy(2, 5);
        let now = Instant::now();

        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::RestartAfter(Duration::ZERO)
        );
        // Second death right after the first attempt: the minimum
        // inter-attempt gap applies.
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::RestartAfter(Duration::from_secs(5))
        );
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::BudgetExhausted
        );
        assert_eq!(guard.attempts_in_window(), 2);
    }

    #[test]
    fn attempts_expire_out_of_the_sliding_window() {
        let mut guard = RestartGuard::default();
        let p = policy(1, 0);
        let now = Instant::now();

        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::RestartAfter(Duration::ZERO)
        );
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::BudgetExhausted
        );

        let later = now + ATTEMPT_WINDOW + Duration::from_secs(60);
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, later),
            RestartDecision::RestartAfter(Duration::ZERO)
        );
    }

    #[test]
    fn unlimited_cap_never_exhausts() {
        let mut guard = RestartGuard::default();
        let p = policy(-1, 0);
        let now = Instant::now();
        for _ in 0..50 {
            assert!(matches!(
                guard.decide(&p, Termination::Unexpected, now),
                RestartDecision::RestartAfter(_)
            ));
        }
    }

    #[test]
    fn min_interval_is_respected_since_last_attempt() {
        let mut guard = RestartGuard::default();
        let p = policy(-1, 10);
        let now = Instant::now();

        assert_eq!(
            guard.decide(&p, Termination::Unexpected, now),
            RestartDecision::RestartAfter(Duration::ZERO)
        );
        // Dies again 4 seconds after the restart attempt.
        let again = now + Duration::from_secs(4);
        assert_eq!(
            guard.decide(&p, Termination::Unexpected, again),
            RestartDecision::RestartAfter(Duration::from_secs(6))
        );
    }
}
