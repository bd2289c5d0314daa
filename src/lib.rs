//! DJAMMS player - local playback process orchestrator
//!
//! Runs an external decode process piped into an external audio output
//! process, drives it with transport commands, broadcasts live status to
//! observers and accepts chunked media uploads.
//!
//! This library provides:
//! - Player controller (play/pause/resume/stop/skip) over a subprocess pair
//! - Periodic status broadcast by observer category
//! - Chunked upload assembly
//! - HTTP, WebSocket and Server-Sent Events surface (axum)

pub mod api;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod player;
pub mod upload;
