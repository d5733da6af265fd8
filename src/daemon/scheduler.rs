use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::NaiveTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::utils::{
    clock::Clock,
    time::{next_local_midnight, next_local_occurrence, until},
};

use super::coordinator::Command;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_QUOTA_CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
/// Longest stretch a wall-clock trigger sleeps before looking at the clock again.
const WALL_CLOCK_RECHECK: Duration = Duration::from_secs(60 * 60);

/// Periodic work the coordinator performs without an outside stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Flush,
    Liveness,
    DailyReset,
    QuotaCheck,
    Cleanup,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Every(Duration),
    LocalMidnight,
    DailyAt(NaiveTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub flush: Duration,
    pub liveness: Duration,
    pub quota_check: Duration,
    pub cleanup: Duration,
    pub backup_time: NaiveTime,
}

impl SchedulerConfig {
    pub fn with_backup_time(backup_time: NaiveTime) -> Self {
        Self {
            flush: DEFAULT_FLUSH_INTERVAL,
            liveness: DEFAULT_LIVENESS_INTERVAL,
            quota_check: DEFAULT_QUOTA_CHECK_INTERVAL,
            cleanup: DEFAULT_CLEANUP_INTERVAL,
            backup_time,
        }
    }

    fn schedule(&self) -> [(Trigger, Cadence); 6] {
        [
            (Trigger::Flush, Cadence::Every(self.flush)),
            (Trigger::Liveness, Cadence::Every(self.liveness)),
            (Trigger::DailyReset, Cadence::LocalMidnight),
            (Trigger::QuotaCheck, Cadence::Every(self.quota_check)),
            (Trigger::Cleanup, Cadence::Every(self.cleanup)),
            (Trigger::Backup, Cadence::DailyAt(self.backup_time)),
        ]
    }
}

/// Fires each [Trigger] on its own timer. A trigger whose previous firing is still queued is
/// skipped rather than stacked, which keeps every trigger idempotent from the coordinator's
/// point of view.
pub struct Scheduler {
    next: mpsc::Sender<Command>,
    config: SchedulerConfig,
    time_provider: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        next: mpsc::Sender<Command>,
        config: SchedulerConfig,
        time_provider: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            next,
            config,
            time_provider,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting scheduler {:?}", self.config);
        let timers = self
            .config
            .schedule()
            .map(|(trigger, cadence)| self.drive(trigger, cadence));
        futures::future::join_all(timers).await;
        Ok(())
    }

    async fn drive(&self, trigger: Trigger, cadence: Cadence) {
        let mut deadline = self.time_provider.instant();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return
                }
                _ = self.wait(cadence, &mut deadline) => ()
            }

            match self.next.try_send(Command::Trigger(trigger)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Coordinator busy, skipping {trigger:?}");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Coordinator stopped, ending {trigger:?} timer");
                    return;
                }
            }
        }
    }

    /// Sleeps until the next firing of `cadence`. `deadline` carries the periodic grid between
    /// calls.
    async fn wait(&self, cadence: Cadence, deadline: &mut tokio::time::Instant) {
        let now = self.time_provider.time();
        let target = match cadence {
            Cadence::Every(period) => {
                *deadline = self.next_deadline(*deadline, period);
                self.time_provider.sleep_until(*deadline).await;
                return;
            }
            Cadence::LocalMidnight => next_local_midnight(now),
            Cadence::DailyAt(at) => next_local_occurrence(now, at),
        };

        // Monotonic time stands still while the machine is suspended, so the wall clock is
        // consulted again at least every WALL_CLOCK_RECHECK.
        loop {
            let remaining = until(self.time_provider.time(), target);
            if remaining.is_zero() {
                return;
            }
            self.time_provider
                .sleep(remaining.min(WALL_CLOCK_RECHECK))
                .await;
        }
    }

    fn next_deadline(
        &self,
        previous: tokio::time::Instant,
        period: Duration,
    ) -> tokio::time::Instant {
        let now_instant = self.time_provider.instant();
        let next = previous + period;
        // Fall back onto the period grid instead of firing a burst after a stall.
        if next < now_instant {
            now_instant + period
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{TimeZone, Utc};

    use crate::utils::clock::manual::ManualClock;

    use super::*;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            flush: Duration::from_secs(5),
            liveness: Duration::from_secs(1),
            quota_check: Duration::from_secs(60),
            cleanup: Duration::from_secs(3600),
            backup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_triggers_fire_at_their_cadence() {
        let (sender, mut receiver) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let scheduler = Scheduler::new(sender, test_config(), Arc::new(clock), shutdown.clone());

        let counting = async {
            let mut counts = HashMap::<Trigger, usize>::new();
            let started = tokio::time::Instant::now();
            while started.elapsed() < Duration::from_millis(10_500) {
                tokio::select! {
                    Some(Command::Trigger(trigger)) = receiver.recv() => {
                        *counts.entry(trigger).or_default() += 1;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => ()
                }
            }
            shutdown.cancel();
            counts
        };

        let (result, counts) = tokio::join!(scheduler.run(), counting);
        result.unwrap();

        assert_eq!(counts.get(&Trigger::Liveness), Some(&10));
        assert_eq!(counts.get(&Trigger::Flush), Some(&2));
        assert_eq!(counts.get(&Trigger::Cleanup), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_coordinator_gets_skipped_triggers_not_a_backlog() {
        let (sender, mut receiver) = mpsc::channel(1);
        let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let scheduler = Scheduler::new(sender, test_config(), Arc::new(clock), CancellationToken::new());

        let still_running = tokio::time::timeout(Duration::from_secs(8), scheduler.run()).await;
        assert!(still_running.is_err());

        assert!(matches!(
            receiver.try_recv(),
            Ok(Command::Trigger(Trigger::Liveness))
        ));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_reset_follows_wall_clock_across_suspend() {
        let (sender, mut receiver) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let midnight = next_local_midnight(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let clock = ManualClock::starting_at(midnight - chrono::Duration::hours(3));
        let config = SchedulerConfig {
            flush: Duration::from_secs(24 * 60 * 60),
            liveness: Duration::from_secs(24 * 60 * 60),
            quota_check: Duration::from_secs(24 * 60 * 60),
            cleanup: Duration::from_secs(24 * 60 * 60),
            backup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        };
        let scheduler = Scheduler::new(sender, config, Arc::new(clock.clone()), shutdown.clone());

        let counting = async {
            tokio::time::sleep(Duration::from_secs(10 * 60)).await;
            // Wall time jumps past midnight while the monotonic clock barely moved.
            clock.advance_secs(3 * 60 * 60);

            let mut resets = 0;
            let started = tokio::time::Instant::now();
            while started.elapsed() < Duration::from_secs(61 * 60) {
                tokio::select! {
                    Some(Command::Trigger(trigger)) = receiver.recv() => {
                        if trigger == Trigger::DailyReset {
                            resets += 1;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => ()
                }
            }
            shutdown.cancel();
            resets
        };

        let (result, resets) = tokio::join!(scheduler.run(), counting);
        result.unwrap();
        assert_eq!(resets, 1);
    }
}
