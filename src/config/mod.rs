//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::player::StageCommand;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Track files and assembled uploads
    #[serde(default)]
    pub media_dir: Option<PathBuf>,

    /// Upload parts while an upload is in progress
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Catalog JSON file
    #[serde(default)]
    pub library: Option<PathBuf>,

    #[serde(default)]
    pub player: PlayerConfig,
}

fn default_port() -> u16 {
    8000
}

impl Config {
    pub fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| get_data_dir().join("uploads"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| get_data_dir().join("upload-parts"))
    }

    pub fn library_path(&self) -> PathBuf {
        self.library
            .clone()
            .unwrap_or_else(|| get_config_dir().join("library.json"))
    }
}

/// Playback subprocesses and timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Reads `{input}` and writes a raw stream to stdout
    pub decoder: StageCommand,
    /// Reads the raw stream on stdin and plays it
    pub output: StageCommand,
    pub grace_period_ms: u64,
    pub status_interval_ms: u64,
    /// Stop playback when the last player connection goes away
    pub stop_on_disconnect: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder: StageCommand::new(
                "ffmpeg",
                &[
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-nostdin",
                    "-i",
                    "{input}",
                    "-f",
                    "wav",
                    "-",
                ],
            ),
            output: StageCommand::new("aplay", &["-q", "-"]),
            grace_period_ms: 5000,
            status_interval_ms: 500,
            stop_on_disconnect: true,
        }
    }
}

impl PlayerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Never zero; a zero period would make the status ticker panic
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

const APP_DIR_NAME: &str = "djamms-player";

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DJAMMS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

/// Get data directory (XDG_DATA_HOME or platform default)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DJAMMS_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from("./data")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        // config.toml / config.json / config.yaml, if present
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // DJAMMS_PORT, DJAMMS_PLAYER__GRACE_PERIOD_MS, ...
        .add_source(
            ::config::Environment::with_prefix("DJAMMS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Explicit precedence: DJAMMS_PORT > PORT > config file > default
    if let Ok(port) = std::env::var("DJAMMS_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const PORT_VARS: [&str; 2] = ["DJAMMS_PORT", "PORT"];

    fn isolated_config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        env::set_var("DJAMMS_CONFIG_DIR", dir.path());
        for var in PORT_VARS {
            env::remove_var(var);
        }
        dir
    }

    fn restore_env() {
        env::remove_var("DJAMMS_CONFIG_DIR");
        for var in PORT_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file_or_env() {
        let _dir = isolated_config_dir();
        let config = load_config().expect("config should load");
        restore_env();

        assert_eq!(config.port, 8000);
        assert_eq!(config.player.grace_period(), Duration::from_secs(5));
        assert_eq!(config.player.status_interval(), Duration::from_millis(500));
        assert!(config.player.stop_on_disconnect);
        assert_eq!(config.player.decoder.program, "ffmpeg");
        assert!(config.player.decoder.args.iter().any(|a| a == "{input}"));
        assert_eq!(config.player.output.program, "aplay");
    }

    #[test]
    #[serial]
    fn test_port_env_fallback() {
        let _dir = isolated_config_dir();
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");
        restore_env();

        assert_eq!(config.port, 3000, "PORT env var should set config.port");
    }

    #[test]
    #[serial]
    fn test_djamms_port_takes_precedence_over_port() {
        let _dir = isolated_config_dir();
        env::set_var("DJAMMS_PORT", "5000");
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");
        restore_env();

        assert_eq!(config.port, 5000, "DJAMMS_PORT should take precedence over PORT");
    }

    #[test]
    #[serial]
    fn test_invalid_port_uses_default() {
        let _dir = isolated_config_dir();
        env::set_var("PORT", "not-a-number");

        let config = load_config().expect("config should load");
        restore_env();

        assert_eq!(config.port, 8000, "Invalid PORT should fall back to default");
    }

    #[test]
    #[serial]
    fn test_config_file_sets_player_commands() {
        let dir = isolated_config_dir();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
port = 9100
media_dir = "/srv/media"

[player]
grace_period_ms = 250

[player.output]
program = "paplay"
args = ["--raw"]
"#,
        )
        .unwrap();

        let config = load_config().expect("config should load");
        restore_env();

        assert_eq!(config.port, 9100);
        assert_eq!(config.media_dir(), PathBuf::from("/srv/media"));
        assert_eq!(config.player.grace_period(), Duration::from_millis(250));
        assert_eq!(config.player.output, StageCommand::new("paplay", &["--raw"]));
        // Unset player fields keep their defaults
        assert_eq!(config.player.decoder.program, "ffmpeg");
        assert_eq!(config.player.status_interval_ms, 500);
    }

    #[test]
    #[serial]
    fn test_nested_env_override() {
        let _dir = isolated_config_dir();
        env::set_var("DJAMMS_PLAYER__STATUS_INTERVAL_MS", "250");
        env::set_var("DJAMMS_PLAYER__STOP_ON_DISCONNECT", "false");

        let config = load_config().expect("config should load");
        env::remove_var("DJAMMS_PLAYER__STATUS_INTERVAL_MS");
        env::remove_var("DJAMMS_PLAYER__STOP_ON_DISCONNECT");
        restore_env();

        assert_eq!(config.player.status_interval(), Duration::from_millis(250));
        assert!(!config.player.stop_on_disconnect);
    }

    #[test]
    #[serial]
    fn test_directory_defaults_follow_env_overrides() {
        let config_dir = isolated_config_dir();
        let data_dir = tempfile::tempdir().unwrap();
        env::set_var("DJAMMS_DATA_DIR", data_dir.path());

        let config = load_config().expect("config should load");
        let media = config.media_dir();
        let scratch = config.scratch_dir();
        let library = config.library_path();
        env::remove_var("DJAMMS_DATA_DIR");
        restore_env();

        assert_eq!(media, data_dir.path().join("uploads"));
        assert_eq!(scratch, data_dir.path().join("upload-parts"));
        assert_eq!(library, config_dir.path().join("library.json"));
    }

    #[test]
    fn test_zero_status_interval_is_clamped() {
        let player = PlayerConfig {
            status_interval_ms: 0,
            ..PlayerConfig::default()
        };
        assert_eq!(player.status_interval(), Duration::from_millis(1));
    }
}
