//! PlaybackStatusMonitor - periodic status broadcast while a pair is running
//!
//! At most one status loop exists at a time. Arming always disarms first, and
//! disarming waits for the loop task to finish, so a stale loop can never
//! publish after a newer one started. When the pair ends on its own the loop
//! reports it to the controller instead of touching playback state itself.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::process::{HealthProbe, StageHealth};
use super::session::PlaybackSession;
use crate::bus::{Category, SharedBroadcaster};

/// Sent to the controller when the armed pair stops running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorReport {
    /// Both stages exited cleanly: the track played to the end
    StagesFinished { generation: u64 },
    /// A stage died or exited with an error
    StagesFailed { generation: u64, reason: String },
}

impl MonitorReport {
    pub fn generation(&self) -> u64 {
        match self {
            Self::StagesFinished { generation } | Self::StagesFailed { generation, .. } => {
                *generation
            }
        }
    }
}

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PlaybackStatusMonitor {
    period: Duration,
    broadcaster: SharedBroadcaster,
    session: watch::Receiver<PlaybackSession>,
    reports: mpsc::Sender<MonitorReport>,
    generation: u64,
    active: Option<ActiveLoop>,
}

impl PlaybackStatusMonitor {
    pub fn new(
        period: Duration,
        broadcaster: SharedBroadcaster,
        session: watch::Receiver<PlaybackSession>,
        reports: mpsc::Sender<MonitorReport>,
    ) -> Self {
        Self {
            period,
            broadcaster,
            session,
            reports,
            generation: 0,
            active: None,
        }
    }

    /// Start a status loop watching `probe`, replacing any previous loop.
    /// Returns the generation tagged on reports from this loop.
    pub async fn arm<P: HealthProbe>(&mut self, probe: P) -> u64 {
        self.disarm().await;

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_status_loop(
            generation,
            self.period,
            probe,
            self.session.clone(),
            self.broadcaster.clone(),
            self.reports.clone(),
            cancel.clone(),
        ));
        debug!(generation, "Status monitor armed");

        self.active = Some(ActiveLoop {
            generation,
            cancel,
            task,
        });
        generation
    }

    /// Stop the status loop and wait for it to exit. No-op when idle.
    pub async fn disarm(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!(generation = active.generation, "Status loop ended abnormally: {}", e);
        }
        debug!(generation = active.generation, "Status monitor disarmed");
    }

    /// Generation of the loop currently running, if any
    pub fn armed_generation(&self) -> Option<u64> {
        self.active
            .as_ref()
            .filter(|a| !a.task.is_finished())
            .map(|a| a.generation)
    }

    pub fn is_armed(&self) -> bool {
        self.armed_generation().is_some()
    }
}

async fn run_status_loop<P: HealthProbe>(
    generation: u64,
    period: Duration,
    probe: P,
    session: watch::Receiver<PlaybackSession>,
    broadcaster: SharedBroadcaster,
    reports: mpsc::Sender<MonitorReport>,
    cancel: CancellationToken,
) {
    // The controller announces the start itself; first tick is one period out
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = match probe.health() {
                    StageHealth::Running | StageHealth::Draining => {
                        let message = {
                            let session = session.borrow();
                            session
                                .is_active()
                                .then(|| session.status_message(std::time::Instant::now()))
                        };
                        if let Some(message) = message {
                            broadcaster.send(Category::Player, &message);
                        }
                        continue;
                    }
                    StageHealth::Idle => break,
                    StageHealth::Finished => MonitorReport::StagesFinished { generation },
                    StageHealth::Failed(reason) => MonitorReport::StagesFailed { generation, reason },
                };

                debug!(generation, ?report, "Playback processes stopped running");
                // try_send: the controller may be waiting on this task in disarm()
                if let Err(e) = reports.try_send(report) {
                    warn!(generation, "Could not deliver monitor report: {}", e);
                }
                break;
            }
        }
    }
}
