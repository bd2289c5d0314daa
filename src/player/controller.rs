//! PlayerController - the authoritative playback state machine
//!
//! The controller is an actor: it owns the [`ProcessPair`], the
//! [`PlaybackStatusMonitor`] and the write side of the session, and handles
//! one command at a time from its mailbox. Handles only send commands and read
//! the published session, so no lock is ever held across a subprocess
//! operation and skip can start the next track without re-entering the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::monitor::{MonitorReport, PlaybackStatusMonitor};
use super::process::{LivenessProbe, ProcessPair, StageHealth};
use super::session::{PlaybackSession, PlaybackState};
use super::PlayerError;
use crate::bus::{BusMessage, Category, EventKind, SharedBroadcaster};
use crate::catalog::{SharedCatalog, Track, TrackId};
use crate::config::PlayerConfig;

const COMMAND_QUEUE: usize = 32;
const REPORT_QUEUE: usize = 8;

/// Transport command as received from a connection or HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum PlayerCommand {
    Play {
        #[serde(alias = "trackId")]
        track_id: TrackId,
    },
    Pause,
    Resume,
    Stop,
    Skip,
}

impl PlayerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Play { .. } => "play",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Skip => "skip",
        }
    }
}

/// Point-in-time view of the player
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatus {
    pub track: Option<Track>,
    pub state: PlaybackState,
    pub position_seconds: f64,
    pub process_alive: bool,
    pub updated_at: DateTime<Utc>,
}

impl PlayerStatus {
    fn from_session(session: &PlaybackSession, process_alive: bool) -> Self {
        Self {
            track: session.track().cloned(),
            state: session.state(),
            position_seconds: session.position_at(Instant::now()).as_secs_f64(),
            process_alive,
            updated_at: session.updated_at(),
        }
    }
}

struct Envelope {
    command: PlayerCommand,
    reply: oneshot::Sender<Result<PlayerStatus, PlayerError>>,
}

/// Cloneable front door to the controller
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<Envelope>,
    session: watch::Receiver<PlaybackSession>,
    probe: LivenessProbe,
}

impl PlayerHandle {
    /// Queue a command and wait for its outcome
    pub async fn execute(&self, command: PlayerCommand) -> Result<PlayerStatus, PlayerError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Envelope { command, reply })
            .await
            .map_err(|_| PlayerError::ControllerUnavailable)?;
        outcome
            .await
            .map_err(|_| PlayerError::ControllerUnavailable)?
    }

    pub async fn play(&self, track_id: TrackId) -> Result<PlayerStatus, PlayerError> {
        self.execute(PlayerCommand::Play { track_id }).await
    }

    pub async fn pause(&self) -> Result<PlayerStatus, PlayerError> {
        self.execute(PlayerCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<PlayerStatus, PlayerError> {
        self.execute(PlayerCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<PlayerStatus, PlayerError> {
        self.execute(PlayerCommand::Stop).await
    }

    pub async fn skip(&self) -> Result<PlayerStatus, PlayerError> {
        self.execute(PlayerCommand::Skip).await
    }

    /// Read-only snapshot; does not go through the command queue
    pub fn status(&self) -> PlayerStatus {
        PlayerStatus::from_session(&self.session.borrow(), self.probe.is_alive())
    }

    pub fn status_message(&self) -> BusMessage {
        self.session.borrow().status_message(Instant::now())
    }

    /// Both playback processes running
    pub fn is_alive(&self) -> bool {
        self.probe.is_alive()
    }
}

pub struct PlayerController {
    pair: ProcessPair,
    monitor: PlaybackStatusMonitor,
    catalog: SharedCatalog,
    broadcaster: SharedBroadcaster,
    session: watch::Sender<PlaybackSession>,
    /// Monitor generation whose reports are current
    armed: Option<u64>,
}

impl PlayerController {
    /// Start the controller task. It runs until `shutdown` is cancelled or
    /// every handle is dropped, and always terminates its processes on exit.
    pub fn spawn(
        config: &PlayerConfig,
        catalog: SharedCatalog,
        broadcaster: SharedBroadcaster,
        shutdown: CancellationToken,
    ) -> (PlayerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);
        let (session_tx, session_rx) = watch::channel(PlaybackSession::stopped());

        let pair = ProcessPair::new(
            config.decoder.clone(),
            config.output.clone(),
            config.grace_period(),
        );
        let probe = pair.probe();
        let monitor = PlaybackStatusMonitor::new(
            config.status_interval(),
            broadcaster.clone(),
            session_rx.clone(),
            report_tx,
        );

        let controller = Self {
            pair,
            monitor,
            catalog,
            broadcaster,
            session: session_tx,
            armed: None,
        };
        let task = tokio::spawn(controller.run(command_rx, report_rx, shutdown));

        let handle = PlayerHandle {
            commands: command_tx,
            session: session_rx,
            probe,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Envelope>,
        mut reports: mpsc::Receiver<MonitorReport>,
        shutdown: CancellationToken,
    ) {
        info!("Player controller started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Player controller shutting down");
                    break;
                }
                envelope = commands.recv() => {
                    let Some(Envelope { command, reply }) = envelope else {
                        debug!("All player handles dropped");
                        break;
                    };
                    let outcome = self.handle(command).await;
                    if reply.send(outcome).is_err() {
                        debug!("Command issuer went away before the reply");
                    }
                }
                Some(report) = reports.recv() => self.on_report(report).await,
            }
        }
        self.close().await;
    }

    async fn handle(&mut self, command: PlayerCommand) -> Result<PlayerStatus, PlayerError> {
        debug!(?command, "Handling player command");
        let name = command.name();
        self.reap_dead_pair().await;

        let outcome = match command {
            PlayerCommand::Play { track_id } => self.play(track_id).await,
            PlayerCommand::Pause => self.pause().await,
            PlayerCommand::Resume => self.resume().await,
            PlayerCommand::Stop => self.stop().await,
            PlayerCommand::Skip => self.skip().await,
        };
        if let Err(e) = &outcome {
            warn!(command = name, "Player command rejected: {}", e);
        }
        outcome.map(|()| self.status())
    }

    async fn play(&mut self, track_id: TrackId) -> Result<(), PlayerError> {
        if self.state() != PlaybackState::Stopped {
            return Err(PlayerError::AlreadyPlaying);
        }
        let track = self.catalog.get_track(track_id).await?;
        self.start_track(track).await
    }

    /// Start `track` from a Stopped session
    async fn start_track(&mut self, track: Track) -> Result<(), PlayerError> {
        info!(track_id = track.id, title = %track.title, "Starting playback");
        if let Err(e) = self.pair.start(&track).await {
            self.fail_session(&e).await;
            return Err(e);
        }

        let detail = format!("Playing {}", track.title);
        self.session
            .send_replace(PlaybackSession::start(track, Instant::now()));
        self.armed = Some(self.monitor.arm(self.pair.probe()).await);
        self.announce(EventKind::Playing, detail);
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PlayerError> {
        match self.state() {
            PlaybackState::Stopped => return Err(PlayerError::NotPlaying),
            PlaybackState::Paused => {
                return Err(PlayerError::InvalidTransition {
                    command: "pause",
                    state: PlaybackState::Paused,
                })
            }
            PlaybackState::Playing => {}
        }
        self.signal_outcome(self.pair.pause()).await?;

        self.session.send_modify(|s| s.pause(Instant::now()));
        self.announce(EventKind::Paused, "Playback paused");
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlayerError> {
        match self.state() {
            PlaybackState::Stopped => return Err(PlayerError::NotPlaying),
            PlaybackState::Playing => {
                return Err(PlayerError::InvalidTransition {
                    command: "resume",
                    state: PlaybackState::Playing,
                })
            }
            PlaybackState::Paused => {}
        }
        self.signal_outcome(self.pair.resume()).await?;

        self.session.send_modify(|s| s.resume(Instant::now()));
        self.announce(EventKind::Playing, "Playback resumed");
        Ok(())
    }

    /// A platform without stop/continue leaves the session alone; any other
    /// signalling failure ends it.
    async fn signal_outcome(&mut self, outcome: Result<(), PlayerError>) -> Result<(), PlayerError> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e @ PlayerError::Unsupported(_)) => Err(e),
            Err(e) => {
                self.fail_session(&e).await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<(), PlayerError> {
        if self.state() == PlaybackState::Stopped {
            return Err(PlayerError::NotPlaying);
        }
        self.teardown().await;
        self.session.send_replace(PlaybackSession::stopped());
        self.announce(EventKind::Stopped, "Playback stopped");
        Ok(())
    }

    async fn skip(&mut self) -> Result<(), PlayerError> {
        let current = match self.state() {
            PlaybackState::Stopped => None,
            _ => self.current_track_id(),
        };
        let Some(current) = current else {
            return Err(PlayerError::NotPlaying);
        };

        self.teardown().await;
        self.session.send_replace(PlaybackSession::stopped());

        match self.catalog.next_in_queue(current).await {
            Ok(Some(next)) => {
                debug!(from = current, to = next.id, "Skipping to next track");
                self.start_track(next).await
            }
            Ok(None) => {
                info!(track_id = current, "Queue exhausted");
                self.announce(EventKind::QueueExhausted, "No more tracks in playlist");
                Ok(())
            }
            Err(e) => {
                let e = PlayerError::from(e);
                error!(track_id = current, "Cannot look up next track: {}", e);
                self.announce(EventKind::Error, e.to_string());
                Err(e)
            }
        }
    }

    async fn on_report(&mut self, report: MonitorReport) {
        if self.armed != Some(report.generation()) {
            debug!(?report, "Ignoring report from a replaced monitor");
            return;
        }
        match report {
            MonitorReport::StagesFinished { .. } => self.finish_track().await,
            MonitorReport::StagesFailed { reason, .. } => {
                self.fail_session(&PlayerError::ProcessDied(reason)).await
            }
        }
    }

    /// Catch a pair that ended since the last monitor tick so the command
    /// sees the real state
    async fn reap_dead_pair(&mut self) {
        if self.state() == PlaybackState::Stopped {
            return;
        }
        match self.pair.health() {
            StageHealth::Running | StageHealth::Draining => {}
            StageHealth::Finished => self.finish_track().await,
            StageHealth::Failed(reason) => {
                self.fail_session(&PlayerError::ProcessDied(reason)).await
            }
            StageHealth::Idle => {
                self.fail_session(&PlayerError::ProcessDied(
                    "no playback processes for active session".to_string(),
                ))
                .await
            }
        }
    }

    async fn finish_track(&mut self) {
        info!(track_id = ?self.current_track_id(), "Track finished");
        self.teardown().await;
        self.session.send_replace(PlaybackSession::stopped());
        self.announce(EventKind::Finished, "Track finished");
    }

    /// Fatal to the session: everything torn down, Stopped, error event
    async fn fail_session(&mut self, cause: &PlayerError) {
        error!(track_id = ?self.current_track_id(), "Playback failed: {}", cause);
        self.teardown().await;
        self.session.send_replace(PlaybackSession::stopped());
        self.announce(EventKind::Error, cause.to_string());
    }

    // Monitor first, so it never observes the processes we are killing
    async fn teardown(&mut self) {
        self.monitor.disarm().await;
        self.armed = None;
        self.pair.terminate().await;
    }

    async fn close(mut self) {
        let was_active = self.state() != PlaybackState::Stopped;
        self.teardown().await;
        if was_active {
            self.session.send_replace(PlaybackSession::stopped());
            self.announce(EventKind::Stopped, "Player shutting down");
        }
        info!("Player controller stopped");
    }

    /// Event followed by an immediate status snapshot
    fn announce(&self, kind: EventKind, detail: impl Into<String>) {
        self.broadcaster
            .send(Category::Player, &BusMessage::event(kind, detail));
        let status = self.session.borrow().status_message(Instant::now());
        self.broadcaster.send(Category::Player, &status);
    }

    fn state(&self) -> PlaybackState {
        self.session.borrow().state()
    }

    fn current_track_id(&self) -> Option<TrackId> {
        self.session.borrow().track().map(|t| t.id)
    }

    fn status(&self) -> PlayerStatus {
        PlayerStatus::from_session(&self.session.borrow(), self.pair.is_alive())
    }
}
