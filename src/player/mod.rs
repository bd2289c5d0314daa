//! Local playback: decode/output subprocess pair, status monitor and the
//! controller state machine that drives both.
//!
//! ```text
//! command ──▶ PlayerHandle ──mpsc──▶ PlayerController (actor, owns everything below)
//!                                      ├── ProcessPair      decode | output
//!                                      ├── StatusMonitor    ticks ──▶ broadcaster
//!                                      └── watch<PlaybackSession> ──▶ handles, monitor
//! ```
//!
//! Commands are serialized by the controller's mailbox: one command runs to
//! completion before the next is looked at.

pub mod controller;
pub mod monitor;
pub mod process;
pub mod session;

pub use controller::{PlayerCommand, PlayerController, PlayerHandle, PlayerStatus};
pub use monitor::{MonitorReport, PlaybackStatusMonitor};
pub use process::{HealthProbe, LivenessProbe, ProcessPair, Stage, StageCommand, StageHealth};
pub use session::{PlaybackSession, PlaybackState};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::catalog::{CatalogError, TrackId};

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("source unavailable: {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {stage} stage: {source}")]
    SpawnFailure {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("already playing")]
    AlreadyPlaying,
    #[error("nothing is playing")]
    NotPlaying,
    #[error("cannot {command} while {state}")]
    InvalidTransition {
        command: &'static str,
        state: PlaybackState,
    },
    #[error("track not found: {0}")]
    TrackNotFound(TrackId),
    #[error("catalog error: {0}")]
    Catalog(CatalogError),
    #[error("failed to signal {stage} stage: {source}")]
    Signal {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("playback process exited unexpectedly: {0}")]
    ProcessDied(String),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("player controller is not running")]
    ControllerUnavailable,
}

impl From<CatalogError> for PlayerError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => Self::TrackNotFound(id),
            other => Self::Catalog(other),
        }
    }
}
