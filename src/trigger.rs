//! Trigger synchronization and monitoring.
//!
//! The synchronization barrier resets the trigger state of every subsystem to
//! a common instant and then arms the trigger unit to count a given number of
//! external triggers. The trigger monitor is a background task that follows
//! the hardware trigger counter until the expected count is reached.

use crate::protocol::{self, check_range, EncodeError, MAX_TRIGGER_VALUE};
use crate::shim::{CommandError, Trigger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Synchronization barrier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Barrier {
    /// Clear the visible trigger counter together with the synchronization.
    pub reset_counter: bool,
    /// Minimum number of clock cycles between accepted triggers.
    pub lockout: u32,
    /// Number of external triggers to arm.
    pub expected: u64,
}

impl Barrier {
    /// Encodes the `SYNC_CH`, `SET_LOCKOUT` and `EXPECT_EXT` commands of the
    /// barrier.
    pub fn words(&self) -> Result<[u32; 3], EncodeError> {
        check_range(
            "expected triggers",
            self.expected as i64,
            0..=MAX_TRIGGER_VALUE.into(),
        )?;
        Ok([
            protocol::trigger::sync_channels(self.reset_counter),
            protocol::trigger::set_lockout(self.lockout)?,
            protocol::trigger::expect_ext(self.expected as u32)?,
        ])
    }

    /// Issues the barrier.
    ///
    /// The three commands are written together, and nothing is written if any
    /// field is out of range or the trigger command FIFO has no room.
    pub fn issue(&self, trigger: &Trigger) -> Result<(), CommandError> {
        let words = self.words()?;
        trigger.cmd().send(&words)?;
        tracing::info!(
            reset_counter = self.reset_counter,
            lockout = self.lockout,
            expected = self.expected,
            "issued trigger synchronization barrier"
        );
        Ok(())
    }
}

/// Trigger monitor tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorConfig {
    /// Interval between reads of the trigger counter.
    pub poll_interval: Duration,
    /// Minimum interval between progress messages.
    pub log_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(500),
            log_interval: Duration::from_secs(3),
        }
    }
}

/// How the trigger monitor ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MonitorOutcome {
    /// The counter reached the expected value.
    Reached(u64),
    /// The monitor was stopped before that.
    Stopped(u64),
}

/// Trigger monitor.
///
/// The monitor polls the trigger counter and ends by itself once the counter
/// reaches the expected value. It only observes the hardware.
#[derive(Debug)]
pub struct TriggerMonitor {
    expected: u64,
    last_count: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: JoinHandle<MonitorOutcome>,
}

impl TriggerMonitor {
    /// Starts a monitor that waits for `expected` triggers.
    pub fn start(trigger: Trigger, expected: u64, config: MonitorConfig) -> TriggerMonitor {
        let last_count = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor(
            trigger,
            expected,
            config,
            Arc::clone(&last_count),
            cancel.clone(),
        ));
        TriggerMonitor {
            expected,
            last_count,
            cancel,
            handle,
        }
    }

    /// Returns the number of triggers the monitor waits for.
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Returns the last counter value seen by the monitor.
    pub fn last_count(&self) -> u64 {
        self.last_count.load(Ordering::Relaxed)
    }

    /// Returns `true` if the monitor has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the monitor and waits for it to end.
    pub async fn stop(self) -> MonitorOutcome {
        self.cancel.cancel();
        let last_count = self.last_count();
        self.handle
            .await
            .unwrap_or(MonitorOutcome::Stopped(last_count))
    }

    /// Returns the monitor state as JSON.
    pub fn json(&self) -> shim_json::TriggerMonitor {
        shim_json::TriggerMonitor {
            expected: self.expected,
            last_count: self.last_count(),
            running: !self.is_finished(),
        }
    }
}

#[tracing::instrument(name = "trigger_monitor", skip_all, fields(expected = expected))]
async fn monitor(
    trigger: Trigger,
    expected: u64,
    config: MonitorConfig,
    last_count: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> MonitorOutcome {
    tracing::info!("trigger monitor started");
    let mut last_log = Instant::now();
    loop {
        let count = u64::from(trigger.count());
        last_count.store(count, Ordering::Relaxed);
        if count >= expected {
            tracing::info!(count, "all expected triggers received");
            return MonitorOutcome::Reached(count);
        }
        if last_log.elapsed() >= config.log_interval {
            tracing::info!(count, remaining = expected - count, "waiting for triggers");
            last_log = Instant::now();
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(count, "trigger monitor stopped");
                return MonitorOutcome::Stopped(count);
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{CommandWord, Subsystem, TriggerOp};
    use crate::regs::status;
    use crate::sim::SimShim;

    fn fast() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(1),
            log_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn barrier_words() {
        let barrier = Barrier {
            reset_counter: true,
            lockout: 50000,
            expected: 12,
        };
        let words = barrier.words().unwrap();
        let ops: Vec<_> = words
            .iter()
            .map(|&w| match CommandWord::decode(Subsystem::Trigger, w).unwrap() {
                CommandWord::Trigger { op, value } => (op, value),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            ops,
            [
                (TriggerOp::SyncCh, 1),
                (TriggerOp::SetLockout, 50000),
                (TriggerOp::ExpectExt, 12)
            ]
        );
    }

    #[test]
    fn barrier_out_of_range_writes_nothing() {
        let sim = SimShim::builder().build();
        let barrier = Barrier {
            reset_counter: false,
            lockout: 0,
            expected: u64::from(MAX_TRIGGER_VALUE) + 1,
        };
        assert!(matches!(
            barrier.issue(sim.shim.trigger()),
            Err(CommandError::Encode(_))
        ));
        assert!(sim.trigger_cmd.written().is_empty());
        let barrier = Barrier {
            expected: 3,
            ..barrier
        };
        barrier.issue(sim.shim.trigger()).unwrap();
        assert_eq!(sim.trigger_cmd.written().len(), 3);
    }

    #[tokio::test]
    async fn monitor_stops_at_expected() {
        let sim = SimShim::builder().build();
        let monitor = TriggerMonitor::start(sim.shim.trigger().clone(), 3, fast());
        sim.status.set(status::TRIG_COUNT, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_finished());
        assert_eq!(monitor.last_count(), 1);
        sim.status.set(status::TRIG_COUNT, 3);
        for _ in 0..1000 {
            if monitor.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!monitor.json().running);
        assert_eq!(monitor.stop().await, MonitorOutcome::Reached(3));
    }

    #[tokio::test]
    async fn monitor_can_be_stopped() {
        let sim = SimShim::builder().build();
        sim.status.set(status::TRIG_COUNT, 2);
        let monitor = TriggerMonitor::start(sim.shim.trigger().clone(), 10, fast());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(monitor.json().running);
        assert_eq!(monitor.stop().await, MonitorOutcome::Stopped(2));
    }
}
