//! The single playback session and its position clock

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::bus::BusMessage;
use crate::catalog::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
        })
    }
}

/// What is playing and how far in.
///
/// Position is kept as time accumulated over previous runs plus the time
/// since the last (re)start, so it only advances while Playing and is frozen
/// while Paused.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    track: Option<Track>,
    state: PlaybackState,
    accumulated: Duration,
    resumed_at: Option<Instant>,
    updated_at: DateTime<Utc>,
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self::stopped()
    }
}

impl PlaybackSession {
    pub fn stopped() -> Self {
        Self {
            track: None,
            state: PlaybackState::Stopped,
            accumulated: Duration::ZERO,
            resumed_at: None,
            updated_at: Utc::now(),
        }
    }

    /// New session for `track`, playing from zero as of `now`
    pub fn start(track: Track, now: Instant) -> Self {
        Self {
            track: Some(track),
            state: PlaybackState::Playing,
            accumulated: Duration::ZERO,
            resumed_at: Some(now),
            updated_at: Utc::now(),
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.accumulated = self.position_at(now);
        self.resumed_at = None;
        self.state = PlaybackState::Paused;
        self.updated_at = Utc::now();
    }

    pub fn resume(&mut self, now: Instant) {
        if self.state != PlaybackState::Paused {
            return;
        }
        self.resumed_at = Some(now);
        self.state = PlaybackState::Playing;
        self.updated_at = Utc::now();
    }

    /// Elapsed playback time as of `now`
    pub fn position_at(&self, now: Instant) -> Duration {
        match (self.state, self.resumed_at) {
            (PlaybackState::Playing, Some(since)) => {
                self.accumulated + now.saturating_duration_since(since)
            }
            _ => self.accumulated,
        }
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Playing or Paused
    pub fn is_active(&self) -> bool {
        self.state != PlaybackState::Stopped
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn status_message(&self, now: Instant) -> BusMessage {
        BusMessage::Status {
            track_id: self.track.as_ref().map(|t| t.id),
            state: self.state,
            position_seconds: self.position_at(now).as_secs_f64(),
            timestamp: Utc::now(),
        }
    }
}
