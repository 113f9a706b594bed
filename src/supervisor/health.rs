use super::processes::ProcessManager;
use crate::settings::SupervisorSettings;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fixed rolling window plus fixed ceiling.
///
/// A profile may crash `ceiling` times inside `window` and still be
/// restarted; the crash that pushes the count past the ceiling leaves it
/// stopped until an operator `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    pub window: Duration,
    pub ceiling: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    Restart,
    GiveUp { crashes: usize },
}

impl CrashPolicy {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            window: settings.crash_window(),
            ceiling: settings.crash_ceiling,
        }
    }

    /// Record a crash at `now` in `history` and decide what to do about it.
    pub fn record_crash(&self, history: &mut VecDeque<Instant>, now: Instant) -> CrashVerdict {
        while let Some(oldest) = history.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                history.pop_front();
            } else {
                break;
            }
        }
        history.push_back(now);

        if history.len() > self.ceiling as usize {
            CrashVerdict::GiveUp {
                crashes: history.len(),
            }
        } else {
            CrashVerdict::Restart
        }
    }
}

/// Periodically reaps exited subprocesses and respawns crashed ones.
pub struct HealthManager {
    manager: Arc<ProcessManager>,
    check_interval: Duration,
}

impl HealthManager {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        let check_interval = manager.settings().health_interval();
        Self {
            manager,
            check_interval,
        }
    }

    /// Run until `shutdown` is cancelled. Spawn this as a background task.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Health manager started (interval: {:?})",
            self.check_interval
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let restarted = self.manager.recover().await;
                    if restarted > 0 {
                        debug!(restarted, "Recovery pass complete");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        debug!("Health manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ceiling: u32) -> CrashPolicy {
        CrashPolicy {
            window: Duration::from_secs(60),
            ceiling,
        }
    }

    #[test]
    fn crashes_up_to_ceiling_are_restarted() {
        let policy = policy(3);
        let mut history = VecDeque::new();
        let now = Instant::now();
        for i in 0..3 {
            assert_eq!(
                policy.record_crash(&mut history, now + Duration::from_secs(i)),
                CrashVerdict::Restart
            );
        }
        assert_eq!(
            policy.record_crash(&mut history, now + Duration::from_secs(3)),
            CrashVerdict::GiveUp { crashes: 4 }
        );
    }

    #[test]
    fn crashes_outside_window_are_forgotten() {
        let policy = policy(1);
        let mut history = VecDeque::new();
        let now = Instant::now();
        assert_eq!(policy.record_crash(&mut history, now), CrashVerdict::Restart);
        assert_eq!(
            policy.record_crash(&mut history, now + Duration::from_secs(61)),
            CrashVerdict::Restart
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn zero_ceiling_never_restarts() {
        let mut history = VecDeque::new();
        assert_eq!(
            policy(0).record_crash(&mut history, Instant::now()),
            CrashVerdict::GiveUp { crashes: 1 }
        );
    }

    #[test]
    fn policy_reads_settings() {
        let settings = SupervisorSettings {
            crash_window_secs: 30,
            crash_ceiling: 2,
            ..Default::default()
        };
        assert_eq!(
            CrashPolicy::from_settings(&settings),
            CrashPolicy {
                window: Duration::from_secs(30),
                ceiling: 2
            }
        );
    }
}
