//! ProcessPair - one decode subprocess piped into one output subprocess
//!
//! The pair is the only owner of the child handles. Every child is spawned
//! with `kill_on_drop`, so a start that is abandoned half-way (error, panic,
//! dropped future) cannot leave a running process behind.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::PlayerError;
use crate::catalog::{Track, TrackId};

/// Placeholder in decoder arguments replaced by the track's storage location
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Which half of the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Decode => "decode",
            Self::Output => "output",
        })
    }
}

/// Program and arguments for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            if arg == INPUT_PLACEHOLDER {
                cmd.arg(input);
            } else if arg.contains(INPUT_PLACEHOLDER) {
                cmd.arg(OsString::from(
                    arg.replace(INPUT_PLACEHOLDER, &input.to_string_lossy()),
                ));
            } else {
                cmd.arg(arg);
            }
        }
        cmd
    }
}

/// Liveness of the pair as seen by a non-blocking poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageHealth {
    /// No pair started (or it is being torn down)
    Idle,
    /// Both stages running
    Running,
    /// Decode finished cleanly, output still playing what is buffered
    Draining,
    /// Both stages exited cleanly
    Finished,
    /// A stage died or exited with an error
    Failed(String),
}

impl StageHealth {
    /// Still producing audio
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Draining)
    }
}

/// Anything that can report pair health without blocking
pub trait HealthProbe: Send + Sync + 'static {
    fn health(&self) -> StageHealth;
}

struct Stages {
    track_id: TrackId,
    decode: Child,
    output: Child,
}

impl Stages {
    fn health(&mut self) -> StageHealth {
        match (self.decode.try_wait(), self.output.try_wait()) {
            (Err(e), _) | (_, Err(e)) => StageHealth::Failed(format!("cannot poll stage: {}", e)),
            (Ok(None), Ok(None)) => StageHealth::Running,
            (Ok(Some(d)), _) if !d.success() => {
                StageHealth::Failed(format!("decode stage exited with {}", d))
            }
            (Ok(Some(_)), Ok(None)) => StageHealth::Draining,
            (_, Ok(Some(o))) if !o.success() => {
                StageHealth::Failed(format!("output stage exited with {}", o))
            }
            (Ok(Some(_)), Ok(Some(_))) => StageHealth::Finished,
            (Ok(None), Ok(Some(_))) => {
                StageHealth::Failed("output stage exited before decode finished".to_string())
            }
        }
    }
}

type SharedStages = Arc<Mutex<Option<Stages>>>;

fn lock(stages: &Mutex<Option<Stages>>) -> MutexGuard<'_, Option<Stages>> {
    stages.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the decode and output subprocesses for the current track
pub struct ProcessPair {
    decoder: StageCommand,
    output: StageCommand,
    grace_period: Duration,
    stages: SharedStages,
}

impl ProcessPair {
    pub fn new(decoder: StageCommand, output: StageCommand, grace_period: Duration) -> Self {
        Self {
            decoder,
            output,
            grace_period,
            stages: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch decode and output for `track`.
    ///
    /// Any pair still around is terminated first. If the output stage cannot
    /// be launched the decode stage is shut down before the error returns.
    pub async fn start(&self, track: &Track) -> Result<(), PlayerError> {
        check_source(&track.storage_location).await?;

        self.terminate().await;

        let mut decode = self
            .decoder
            .command(&track.storage_location)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PlayerError::SpawnFailure {
                stage: Stage::Decode,
                source,
            })?;

        let output = match self.spawn_output(&mut decode, &track.storage_location) {
            Ok(child) => child,
            Err(e) => {
                warn!(track_id = track.id, "Output stage failed to start, stopping decode");
                shutdown_stage(Stage::Decode, &mut decode, self.grace_period).await;
                return Err(e);
            }
        };

        info!(
            track_id = track.id,
            decode_pid = ?decode.id(),
            output_pid = ?output.id(),
            "Playback processes started"
        );

        *lock(&self.stages) = Some(Stages {
            track_id: track.id,
            decode,
            output,
        });
        Ok(())
    }

    fn spawn_output(&self, decode: &mut Child, input: &Path) -> Result<Child, PlayerError> {
        let spawn_error = |source| PlayerError::SpawnFailure {
            stage: Stage::Output,
            source,
        };
        let pipe: Stdio = decode
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("decode stage has no stdout pipe")))?
            .try_into()
            .map_err(spawn_error)?;

        self.output
            .command(input)
            .stdin(pipe)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)
    }

    /// Stop both stages, output first so it never blocks on a broken pipe.
    /// Each stage gets the grace period to exit before it is killed.
    /// Calling this on an idle pair does nothing.
    pub async fn terminate(&self) {
        let stages = lock(&self.stages).take();
        let Some(mut stages) = stages else {
            return;
        };

        debug!(track_id = stages.track_id, "Terminating playback processes");
        shutdown_stage(Stage::Output, &mut stages.output, self.grace_period).await;
        shutdown_stage(Stage::Decode, &mut stages.decode, self.grace_period).await;
        info!(track_id = stages.track_id, "Playback processes terminated");
    }

    /// Suspend both stages
    pub fn pause(&self) -> Result<(), PlayerError> {
        self.signal_stages(Transport::Suspend)
    }

    /// Continue both stages
    pub fn resume(&self) -> Result<(), PlayerError> {
        self.signal_stages(Transport::Continue)
    }

    fn signal_stages(&self, action: Transport) -> Result<(), PlayerError> {
        let mut guard = lock(&self.stages);
        let stages = guard.as_mut().ok_or(PlayerError::NotPlaying)?;

        // Suspend the producer first; wake the consumer first.
        let order = match action {
            Transport::Suspend => [
                (Stage::Decode, &mut stages.decode),
                (Stage::Output, &mut stages.output),
            ],
            Transport::Continue => [
                (Stage::Output, &mut stages.output),
                (Stage::Decode, &mut stages.decode),
            ],
        };

        let mut signalled = 0;
        for (stage, child) in order {
            if !matches!(child.try_wait(), Ok(None)) {
                continue;
            }
            let Some(pid) = child.id() else {
                continue;
            };
            action.apply(pid).map_err(|source| {
                if source.kind() == io::ErrorKind::Unsupported {
                    PlayerError::Unsupported("process suspension")
                } else {
                    PlayerError::Signal { stage, source }
                }
            })?;
            debug!(%stage, pid, ?action, "Signalled stage");
            signalled += 1;
        }

        if signalled == 0 {
            return Err(PlayerError::NotPlaying);
        }
        Ok(())
    }

    /// Both stages still running
    pub fn is_alive(&self) -> bool {
        lock(&self.stages)
            .as_mut()
            .is_some_and(|s| s.health() == StageHealth::Running)
    }

    pub fn health(&self) -> StageHealth {
        lock(&self.stages)
            .as_mut()
            .map_or(StageHealth::Idle, Stages::health)
    }

    /// (decode, output) process ids of a live pair
    pub fn pids(&self) -> Option<(u32, u32)> {
        let guard = lock(&self.stages);
        let stages = guard.as_ref()?;
        Some((stages.decode.id()?, stages.output.id()?))
    }

    /// Read-only liveness handle for tasks that must not own the pair
    pub fn probe(&self) -> LivenessProbe {
        LivenessProbe {
            stages: Arc::downgrade(&self.stages),
        }
    }
}

/// Non-owning liveness view of a [`ProcessPair`]
#[derive(Clone)]
pub struct LivenessProbe {
    stages: Weak<Mutex<Option<Stages>>>,
}

impl LivenessProbe {
    pub fn is_alive(&self) -> bool {
        self.health() == StageHealth::Running
    }
}

impl HealthProbe for LivenessProbe {
    fn health(&self) -> StageHealth {
        let Some(stages) = self.stages.upgrade() else {
            return StageHealth::Idle;
        };
        let mut guard = lock(&stages);
        guard.as_mut().map_or(StageHealth::Idle, Stages::health)
    }
}

async fn check_source(path: &Path) -> Result<(), PlayerError> {
    let unavailable = |source| PlayerError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    };
    let file = tokio::fs::File::open(path).await.map_err(unavailable)?;
    let metadata = file.metadata().await.map_err(unavailable)?;
    if !metadata.is_file() {
        return Err(unavailable(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    Ok(())
}

/// Ask a stage to exit, wait up to `grace`, then kill it
async fn shutdown_stage(stage: Stage, child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(%stage, %status, "Stage already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => warn!(%stage, "Cannot poll stage before shutdown: {}", e),
    }

    request_exit(stage, child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%stage, %status, "Stage exited"),
        Ok(Err(e)) => warn!(%stage, "Error waiting for stage: {}", e),
        Err(_) => {
            warn!(%stage, ?grace, "Stage ignored terminate, killing");
            if let Err(e) = child.kill().await {
                warn!(%stage, "Failed to kill stage: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(stage: Stage, child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // A suspended process only acts on TERM once it is continued
    for signal in [libc::SIGTERM, libc::SIGCONT] {
        if let Err(e) = send_signal(pid, signal) {
            debug!(%stage, pid, signal, "Signal not delivered: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(stage: Stage, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(%stage, "Kill not delivered: {}", e);
    }
}

#[derive(Debug, Clone, Copy)]
enum Transport {
    Suspend,
    Continue,
}

impl Transport {
    #[cfg(unix)]
    fn apply(self, pid: u32) -> io::Result<()> {
        let signal = match self {
            Self::Suspend => libc::SIGSTOP,
            Self::Continue => libc::SIGCONT,
        };
        send_signal(pid, signal)
    }

    /// No stop/continue here. Pause and resume report Unsupported and the
    /// session keeps running untouched.
    // TODO: relay decode output through a task that can hold the pipe, so
    // pause works without signals
    #[cfg(not(unix))]
    fn apply(self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stop/continue signals are not available on this platform",
        ))
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
