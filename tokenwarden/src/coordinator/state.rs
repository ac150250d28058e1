//! Recovery state machine.
//!
//! [`RecoveryState`] holds every deadline the coordinator waits on and is the
//! only place they change. It takes `now` as an argument and performs no I/O,
//! so transitions can be tested without timers.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Timing knobs of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorTimings {
    /// Minimum gap between two recovery reloads.
    pub min_reload_interval: Duration,
    /// How long a recovery may wait for a token.
    pub token_timeout: Duration,
    /// Second, independent timeout armed after every reload.
    pub backup_alarm_delay: Duration,
    /// A reload younger than this counts as recent for the backup alarm and sweep.
    pub stale_reload_after: Duration,
    pub fast_retry_delay: Duration,
    pub fast_retry_max: u32,
    pub safety_sweep_interval: Duration,
    pub short_poll_first: Duration,
    pub short_poll_interval: Duration,
    pub cookie_first: Duration,
    pub cookie_interval: Duration,
    /// Pause between hook injection and the reload request.
    pub settle_delay: Duration,
    /// Pause before the forced hard reload.
    pub hard_reload_delay: Duration,
    /// Pause before the second reload of a tab that is not loading.
    pub second_shot_delay: Duration,
    /// Pause before the long poll is restarted after a settings change.
    pub poll_restart_delay: Duration,
}

impl Default for CoordinatorTimings {
    fn default() -> Self {
        Self {
            min_reload_interval: Duration::from_secs(5),
            token_timeout: Duration::from_secs(25),
            backup_alarm_delay: Duration::from_secs(60),
            stale_reload_after: Duration::from_secs(45),
            fast_retry_delay: Duration::from_secs(7),
            fast_retry_max: 3,
            safety_sweep_interval: Duration::from_secs(60),
            short_poll_first: Duration::from_secs(6),
            short_poll_interval: Duration::from_secs(45),
            cookie_first: Duration::from_secs(60),
            cookie_interval: Duration::from_secs(20 * 60),
            settle_delay: Duration::from_millis(150),
            hard_reload_delay: Duration::from_millis(200),
            second_shot_delay: Duration::from_millis(1500),
            poll_restart_delay: Duration::from_millis(100),
        }
    }
}

/// Identifies one recovery cycle; reload reports from older cycles are ignored.
pub type CycleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryPhase {
    Idle,
    /// Waiting for a token until `deadline`. `reloaded` is false while the
    /// cycle's tab preparation is still running.
    Recovering {
        cycle: CycleId,
        deadline: Instant,
        reloaded: bool,
    },
}

/// Outcome of checking the primary timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    NotDue,
    /// The deadline passed before the cycle's reload was issued; the wait was
    /// extended instead of starting an overlapping cycle.
    Extended,
    /// The cycle was cleared and a new one may be requested.
    Expired,
}

/// Why a recovery request was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InProgress,
    Cooldown { remaining: Duration },
}

/// Outcome of polling the fast-retry timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastRetry {
    NotDue,
    /// The retry fired; `request` says whether a new recovery should be attempted.
    Due { request: bool },
}

/// Serializable view of the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverySnapshot {
    pub in_progress: bool,
    pub cycle: Option<CycleId>,
    pub fast_retries_remaining: u32,
    pub since_last_reload_ms: Option<u64>,
    pub timeout_in_ms: Option<u64>,
    pub backup_alarm_in_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RecoveryState {
    timings: CoordinatorTimings,
    phase: RecoveryPhase,
    last_cycle: CycleId,
    last_reload_at: Option<Instant>,
    fast_retries_remaining: u32,
    next_fast_retry: Option<Instant>,
    backup_alarm: Option<Instant>,
}

impl RecoveryState {
    pub fn new(timings: CoordinatorTimings) -> Self {
        Self {
            timings,
            phase: RecoveryPhase::Idle,
            last_cycle: 0,
            last_reload_at: None,
            fast_retries_remaining: 0,
            next_fast_retry: None,
            backup_alarm: None,
        }
    }

    pub fn timings(&self) -> &CoordinatorTimings {
        &self.timings
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.phase, RecoveryPhase::Recovering { .. })
    }

    pub fn fast_retries_remaining(&self) -> u32 {
        self.fast_retries_remaining
    }

    pub fn last_reload_at(&self) -> Option<Instant> {
        self.last_reload_at
    }

    /// Primary timeout, armed iff a recovery is in progress.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            RecoveryPhase::Recovering { deadline, .. } => Some(deadline),
            RecoveryPhase::Idle => None,
        }
    }

    pub fn current_cycle(&self) -> Option<CycleId> {
        match self.phase {
            RecoveryPhase::Recovering { cycle, .. } => Some(cycle),
            RecoveryPhase::Idle => None,
        }
    }

    pub fn next_fast_retry(&self) -> Option<Instant> {
        self.next_fast_retry
    }

    pub fn backup_alarm(&self) -> Option<Instant> {
        self.backup_alarm
    }

    /// In progress and the cycle's reload has been issued.
    fn awaiting_token(&self) -> bool {
        matches!(self.phase, RecoveryPhase::Recovering { reloaded: true, .. })
    }

    fn reloaded_within(&self, now: Instant, window: Duration) -> bool {
        self.last_reload_at
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    /// Enter `Recovering` unless a recovery is running or the cooldown holds.
    ///
    /// Returns the id the reload task must report back with.
    pub fn begin(&mut self, now: Instant) -> Result<CycleId, SkipReason> {
        if self.in_progress() {
            return Err(SkipReason::InProgress);
        }
        if let Some(at) = self.last_reload_at {
            let elapsed = now.saturating_duration_since(at);
            if elapsed < self.timings.min_reload_interval {
                return Err(SkipReason::Cooldown {
                    remaining: self.timings.min_reload_interval - elapsed,
                });
            }
        }

        self.last_cycle += 1;
        self.phase = RecoveryPhase::Recovering {
            cycle: self.last_cycle,
            deadline: now + self.timings.token_timeout,
            reloaded: false,
        };
        Ok(self.last_cycle)
    }

    /// The reload for `cycle` was issued.
    ///
    /// Records the reload time, re-arms the primary timeout from now and arms
    /// the backup alarm. Returns `false` and changes nothing when `cycle` is
    /// not the current one.
    pub fn reload_issued(&mut self, cycle: CycleId, now: Instant) -> bool {
        if self.current_cycle() != Some(cycle) {
            return false;
        }
        self.last_reload_at = Some(now);
        self.phase = RecoveryPhase::Recovering {
            cycle,
            deadline: now + self.timings.token_timeout,
            reloaded: true,
        };
        self.backup_alarm = Some(now + self.timings.backup_alarm_delay);
        true
    }

    /// A token arrived: cancel every pending wait.
    pub fn token_delivered(&mut self, now: Instant) {
        self.clear_wait();
        self.backup_alarm = None;
        self.last_reload_at = Some(now);
    }

    /// Drop the current cycle and the fast-retry burst.
    pub fn clear_wait(&mut self) {
        self.phase = RecoveryPhase::Idle;
        self.fast_retries_remaining = 0;
        self.next_fast_retry = None;
    }

    /// Check the primary timeout.
    ///
    /// A cycle whose reload has not been issued yet is never replaced; its
    /// deadline moves forward until the preparation task reports back.
    pub fn expire(&mut self, now: Instant) -> Expiry {
        match self.phase {
            RecoveryPhase::Recovering {
                cycle,
                deadline,
                reloaded: false,
            } if now >= deadline => {
                self.phase = RecoveryPhase::Recovering {
                    cycle,
                    deadline: now + self.timings.token_timeout,
                    reloaded: false,
                };
                Expiry::Extended
            }
            RecoveryPhase::Recovering { deadline, .. } if now >= deadline => {
                self.clear_wait();
                Expiry::Expired
            }
            _ => Expiry::NotDue,
        }
    }

    /// Arm a fresh fast-retry burst.
    pub fn start_burst(&mut self, now: Instant) {
        self.fast_retries_remaining = self.timings.fast_retry_max;
        self.next_fast_retry = (self.fast_retries_remaining > 0)
            .then(|| now + self.timings.fast_retry_delay);
    }

    pub fn take_fast_retry(&mut self, now: Instant) -> FastRetry {
        match self.next_fast_retry {
            Some(at) if now >= at => {}
            _ => return FastRetry::NotDue,
        }
        if self.fast_retries_remaining == 0 {
            self.next_fast_retry = None;
            return FastRetry::NotDue;
        }

        let request = !self.in_progress();
        self.fast_retries_remaining -= 1;
        self.next_fast_retry = (self.fast_retries_remaining > 0)
            .then(|| now + self.timings.fast_retry_delay);
        FastRetry::Due { request }
    }

    /// Fire the backup alarm if due.
    ///
    /// Returns `true` when a recovery is stuck (its reload was issued, no token
    /// arrived and the last reload is not recent); the cycle is then cleared
    /// and the caller should request a new one. A cycle still preparing its
    /// tab is left alone.
    pub fn take_backup_alarm(&mut self, now: Instant) -> bool {
        match self.backup_alarm {
            Some(at) if now >= at => self.backup_alarm = None,
            _ => return false,
        }
        if !self.awaiting_token() || self.reloaded_within(now, self.timings.stale_reload_after) {
            return false;
        }
        self.clear_wait();
        true
    }

    /// Whether the periodic safety sweep should reload the site tabs.
    pub fn safety_sweep_due(&self, now: Instant) -> bool {
        !self.in_progress() && !self.reloaded_within(now, self.timings.stale_reload_after)
    }

    pub fn sweep_reloaded(&mut self, now: Instant) {
        self.last_reload_at = Some(now);
    }

    /// Return to idle, keeping the reload time so the cooldown still holds.
    pub fn reset(&mut self) {
        self.clear_wait();
        self.backup_alarm = None;
    }

    pub fn snapshot(&self, now: Instant) -> RecoverySnapshot {
        let until = |at: Instant| at.saturating_duration_since(now).as_millis() as u64;
        RecoverySnapshot {
            in_progress: self.in_progress(),
            cycle: self.current_cycle(),
            fast_retries_remaining: self.fast_retries_remaining,
            since_last_reload_ms: self
                .last_reload_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            timeout_in_ms: self.deadline().map(until),
            backup_alarm_in_ms: self.backup_alarm.map(until),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (RecoveryState, Instant) {
        (RecoveryState::new(CoordinatorTimings::default()), Instant::now())
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_begin_guards() {
        let (mut s, t0) = state();
        assert_eq!(s.begin(t0), Ok(1));
        assert!(s.in_progress());
        assert_eq!(s.deadline(), Some(t0 + secs(25)));
        assert_eq!(s.begin(t0), Err(SkipReason::InProgress));

        assert!(s.reload_issued(1, t0));
        s.token_delivered(t0 + secs(1));
        assert!(!s.in_progress());
        assert_eq!(
            s.begin(t0 + secs(3)),
            Err(SkipReason::Cooldown {
                remaining: secs(3)
            })
        );
        assert_eq!(s.begin(t0 + secs(6)), Ok(2));
    }

    #[test]
    fn test_in_progress_iff_timeout_armed() {
        let (mut s, t0) = state();
        assert_eq!(s.in_progress(), s.deadline().is_some());
        let cycle = s.begin(t0).unwrap();
        assert_eq!(s.in_progress(), s.deadline().is_some());
        s.reload_issued(cycle, t0 + secs(1));
        assert_eq!(s.deadline(), Some(t0 + secs(26)));
        assert_eq!(s.expire(t0 + secs(26)), Expiry::Expired);
        assert_eq!(s.in_progress(), s.deadline().is_some());
        assert!(!s.in_progress());
    }

    #[test]
    fn test_expire_only_after_deadline() {
        let (mut s, t0) = state();
        let cycle = s.begin(t0).unwrap();
        s.reload_issued(cycle, t0);
        assert_eq!(s.expire(t0 + secs(24)), Expiry::NotDue);
        assert!(s.in_progress());
        assert_eq!(s.expire(t0 + secs(25)), Expiry::Expired);
        assert_eq!(s.expire(t0 + secs(26)), Expiry::NotDue);
    }

    #[test]
    fn test_slow_preparation_extends_instead_of_expiring() {
        let (mut s, t0) = state();
        let cycle = s.begin(t0).unwrap();

        assert_eq!(s.expire(t0 + secs(25)), Expiry::Extended);
        assert!(s.in_progress());
        assert_eq!(s.current_cycle(), Some(cycle));
        assert_eq!(s.deadline(), Some(t0 + secs(50)));
        assert_eq!(s.begin(t0 + secs(30)), Err(SkipReason::InProgress));

        assert!(s.reload_issued(cycle, t0 + secs(31)));
        assert_eq!(s.deadline(), Some(t0 + secs(56)));
        assert_eq!(s.expire(t0 + secs(56)), Expiry::Expired);
    }

    #[test]
    fn test_stale_reload_report_is_ignored() {
        let (mut s, t0) = state();
        let first = s.begin(t0).unwrap();
        s.reset();
        let second = s.begin(t0 + secs(1)).unwrap();
        assert_ne!(first, second);

        assert!(!s.reload_issued(first, t0 + secs(2)));
        assert_eq!(s.last_reload_at(), None);
        assert!(s.backup_alarm().is_none());
        assert_eq!(s.deadline(), Some(t0 + secs(26)));

        assert!(s.reload_issued(second, t0 + secs(3)));
        assert_eq!(s.last_reload_at(), Some(t0 + secs(3)));
    }

    #[test]
    fn test_token_delivery_cancels_everything() {
        let (mut s, t0) = state();
        let cycle = s.begin(t0).unwrap();
        s.reload_issued(cycle, t0);
        s.start_burst(t0);

        s.token_delivered(t0 + secs(2));

        assert!(s.deadline().is_none());
        assert!(s.next_fast_retry().is_none());
        assert!(s.backup_alarm().is_none());
        assert_eq!(s.fast_retries_remaining(), 0);
        assert_eq!(s.last_reload_at(), Some(t0 + secs(2)));
    }

    #[test]
    fn test_fast_retry_burst_counts_down() {
        let (mut s, t0) = state();
        s.start_burst(t0);
        assert_eq!(s.take_fast_retry(t0 + secs(6)), FastRetry::NotDue);

        let mut fired = 0;
        let mut now = t0;
        while let Some(at) = s.next_fast_retry() {
            now = at;
            assert_eq!(s.take_fast_retry(now), FastRetry::Due { request: true });
            fired += 1;
        }
        assert_eq!(fired, 3);
        assert_eq!(now, t0 + secs(21));
        assert_eq!(s.fast_retries_remaining(), 0);
    }

    #[test]
    fn test_fast_retry_skips_request_while_recovering() {
        let (mut s, t0) = state();
        s.begin(t0).unwrap();
        s.start_burst(t0);
        assert_eq!(
            s.take_fast_retry(t0 + secs(7)),
            FastRetry::Due { request: false }
        );
        assert_eq!(s.fast_retries_remaining(), 2);
    }

    #[test]
    fn test_backup_alarm_only_acts_on_stuck_recovery() {
        let (mut s, t0) = state();
        let cycle = s.begin(t0).unwrap();
        s.reload_issued(cycle, t0);
        assert!(!s.take_backup_alarm(t0 + secs(59)));

        // Primary timeout was missed entirely.
        assert!(s.take_backup_alarm(t0 + secs(60)));
        assert!(!s.in_progress());
        assert!(s.backup_alarm().is_none());

        // A recent reload suppresses it.
        let cycle = s.begin(t0 + secs(61)).unwrap();
        s.reload_issued(cycle, t0 + secs(61));
        s.sweep_reloaded(t0 + secs(100));
        assert!(!s.take_backup_alarm(t0 + secs(121)));
        assert!(s.in_progress());
    }

    #[test]
    fn test_backup_alarm_leaves_preparing_cycle_alone() {
        let (mut s, t0) = state();
        let first = s.begin(t0).unwrap();
        s.reload_issued(first, t0);
        assert_eq!(s.expire(t0 + secs(25)), Expiry::Expired);

        // The next cycle is still preparing when the first cycle's alarm fires.
        let second = s.begin(t0 + secs(25)).unwrap();
        assert!(!s.take_backup_alarm(t0 + secs(60)));
        assert_eq!(s.current_cycle(), Some(second));
    }

    #[test]
    fn test_safety_sweep_staleness() {
        let (mut s, t0) = state();
        assert!(s.safety_sweep_due(t0));
        s.sweep_reloaded(t0);
        assert!(!s.safety_sweep_due(t0 + secs(44)));
        assert!(s.safety_sweep_due(t0 + secs(45)));
        s.begin(t0 + secs(50)).unwrap();
        assert!(!s.safety_sweep_due(t0 + secs(120)));
    }

    #[test]
    fn test_reset_keeps_cooldown() {
        let (mut s, t0) = state();
        let cycle = s.begin(t0).unwrap();
        s.reload_issued(cycle, t0);
        s.start_burst(t0);
        s.reset();

        assert!(!s.in_progress());
        assert!(s.next_fast_retry().is_none());
        assert!(s.backup_alarm().is_none());
        assert!(matches!(
            s.begin(t0 + secs(1)),
            Err(SkipReason::Cooldown { .. })
        ));
    }
}
