use anyhow::Result;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::task::{Preset, Task};
use crate::utils::UrlUtils;

pub mod defaults;
pub mod duration_serde;

pub use defaults::*;

/// Channel name that matches every live stream of a service
pub const WILDCARD_NAME: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub packaging: PackagingConfig,
    #[serde(default)]
    pub presets: BTreeMap<String, Preset>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_push: Option<StatsPushConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_mpd_dir")]
    pub mpd_dir: PathBuf,
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How often liveness is polled
    #[serde(default = "default_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,
    /// Delay before attempt N+1 is `N * backoff_step`
    #[serde(default = "default_backoff_step", with = "duration_serde::duration")]
    pub backoff_step: Duration,
    #[serde(default = "default_http_timeout", with = "duration_serde::duration")]
    pub http_timeout: Duration,
    /// Upper bound on waiting for killed members to report their exit
    #[serde(default = "default_drain_timeout", with = "duration_serde::duration")]
    pub drain_timeout: Duration,
    #[serde(default = "default_status_interval", with = "duration_serde::duration")]
    pub status_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingConfig {
    /// Segment length in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    /// Number of segments kept in the manifest
    #[serde(default = "default_window_size")]
    pub window_size: u32,
}

/// Layout of the external stats API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// `{stats_base}/channels/list` and `{stats_base}/channels/{host}/{app}/{name}`
    #[default]
    KlpqStream,
    /// `{stats_base}/{name}`, no channel listing
    Simple,
}

impl ServiceKind {
    pub fn supports_listing(&self) -> bool {
        matches!(self, ServiceKind::KlpqStream)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ServiceKind,
    pub stats_base: String,
    /// e.g. `rtmp://origin.example.com`
    pub rtmp_base: String,
    /// RTMP application the channels are published under
    pub app: String,
    #[serde(default)]
    pub channels: Vec<ChannelSpecConfig>,
}

impl ServiceConfig {
    pub fn source_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.rtmp_base.trim_end_matches('/'),
            self.app,
            name
        )
    }

    /// Host portion of `rtmp_base`, used in stats paths and as the default origin
    pub fn rtmp_host(&self) -> String {
        UrlUtils::host(&self.rtmp_base).unwrap_or_else(|| {
            self.rtmp_base
                .split("://")
                .last()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpecConfig {
    /// Stable id; generated at startup when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl ChannelSpecConfig {
    pub fn is_wildcard(&self) -> bool {
        self.name == WILDCARD_NAME
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPushConfig {
    pub url: String,
    pub token: String,
    #[serde(default = "default_stats_push_interval", with = "duration_serde::duration")]
    pub interval: Duration,
    /// Only report channels whose source host matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from(DEFAULT_FFMPEG_PATH)
}

fn default_mpd_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MPD_DIR)
}

fn default_hls_dir() -> PathBuf {
    PathBuf::from(DEFAULT_HLS_DIR)
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOGS_DIR)
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_backoff_step() -> Duration {
    DEFAULT_BACKOFF_STEP
}

fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

fn default_status_interval() -> Duration {
    DEFAULT_STATUS_INTERVAL
}

fn default_segment_duration() -> u32 {
    DEFAULT_SEGMENT_DURATION_SECS
}

fn default_window_size() -> u32 {
    DEFAULT_WINDOW_SIZE
}

fn default_stats_push_interval() -> Duration {
    DEFAULT_STATS_PUSH_INTERVAL
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mpd_dir: default_mpd_dir(),
            hls_dir: default_hls_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            backoff_step: default_backoff_step(),
            http_timeout: default_http_timeout(),
            drain_timeout: default_drain_timeout(),
            status_interval: default_status_interval(),
        }
    }
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            segment_duration: default_segment_duration(),
            window_size: default_window_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            paths: PathsConfig::default(),
            supervisor: SupervisorConfig::default(),
            packaging: PackagingConfig::default(),
            presets: BTreeMap::new(),
            services: Vec::new(),
            stats_push: None,
        }
    }
}

impl Config {
    /// Loads the TOML file merged with `RELAY_WORKER_*` environment overrides.
    /// A default file is written when none exists.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !Path::new(config_file).exists() {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
        }

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Structural checks that do not touch the filesystem.
    pub fn validate(&self) -> AppResult<()> {
        if self.ffmpeg_path.as_os_str().is_empty() {
            return Err(AppError::configuration("ffmpeg_path must not be empty"));
        }
        if self.supervisor.poll_interval.is_zero() {
            return Err(AppError::configuration("supervisor.poll_interval must be greater than zero"));
        }

        let mut ids = HashSet::new();
        for service in &self.services {
            for spec in &service.channels {
                if let Some(id) = &spec.id
                    && !ids.insert(id.clone())
                {
                    return Err(AppError::configuration(format!(
                        "duplicate channel id '{id}' in service '{}'",
                        service.name
                    )));
                }
                if spec.is_wildcard() && !service.kind.supports_listing() {
                    return Err(AppError::configuration(format!(
                        "service '{}' cannot resolve wildcard channels: {:?} has no channel listing",
                        service.name, service.kind
                    )));
                }
                for task in &spec.tasks {
                    if let Task::Encode { preset, .. } = task
                        && !self.presets.contains_key(preset)
                    {
                        warn!(
                            "service={} channel={} references unknown preset '{}'; task will be skipped",
                            service.name, spec.name, preset
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Fatal startup precondition: the transcoder binary must exist.
    pub fn check_ffmpeg(&self) -> AppResult<()> {
        if self.ffmpeg_path.exists() {
            Ok(())
        } else {
            Err(AppError::configuration(format!(
                "ffmpeg binary not found at {}",
                self.ffmpeg_path.display()
            )))
        }
    }

    /// Creates the output and log directories if missing.
    pub fn ensure_directories(&self) -> AppResult<()> {
        for dir in [&self.paths.mpd_dir, &self.paths.hls_dir, &self.paths.logs_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::PackageFormat;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
        ffmpeg_path = "/usr/bin/ffmpeg"

        [supervisor]
        poll_interval = "2s"
        backoff_step = 3

        [presets.720p]
        scale = 720
        fps = 30
        preset = "veryfast"
        crf = 23
        vBitrate = 2500
        aBitrate = 128

        [[services]]
        name = "klpq"
        stats_base = "http://stats.example.com/api"
        rtmp_base = "rtmp://origin.example.com"
        app = "live"

        [[services.channels]]
        id = "main"
        name = "alpha"

        [[services.channels.tasks]]
        task = "package"
        format = "mpd"

        [[services.channels]]
        name = "*"
    "#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.supervisor.poll_interval, Duration::from_secs(2));
        assert_eq!(config.supervisor.backoff_step, Duration::from_secs(3));
        assert_eq!(config.supervisor.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(config.presets["720p"].video_bitrate, 2500);

        let service = &config.services[0];
        assert_eq!(service.kind, ServiceKind::KlpqStream);
        assert_eq!(service.channels[0].id.as_deref(), Some("main"));
        assert_eq!(
            service.channels[0].tasks,
            vec![Task::Package { format: PackageFormat::Mpd }]
        );
        assert!(service.channels[1].is_wildcard());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_apply_to_empty_document() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.ffmpeg_path, PathBuf::from("/usr/bin/ffmpeg"));
        assert_eq!(config.paths.mpd_dir, PathBuf::from("mpd"));
        assert_eq!(config.supervisor.backoff_step, Duration::from_secs(10));
        assert_eq!(config.packaging.window_size, DEFAULT_WINDOW_SIZE);
        assert!(config.stats_push.is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        let dup = config.services[0].channels[0].clone();
        config.services[0].channels.push(dup);
        assert!(matches!(
            config.validate(),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn wildcard_requires_listing_support() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.services[0].kind = ServiceKind::Simple;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_preset_is_not_a_validation_error() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.services[0].channels[0].tasks.push(Task::Encode {
            preset: "4k".into(),
            urls: vec!["rtmp://x/live/y".into()],
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_ffmpeg_is_reported() {
        let config = Config {
            ffmpeg_path: PathBuf::from("/definitely/not/here/ffmpeg"),
            ..Config::default()
        };
        assert!(config.check_ffmpeg().is_err());
    }

    #[test]
    fn load_from_file_writes_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path_str = path.to_str().unwrap();

        let config = Config::load_from_file(path_str).unwrap();
        assert!(path.exists());
        assert_eq!(config.supervisor.poll_interval, DEFAULT_POLL_INTERVAL);

        let reloaded = Config::load_from_file(path_str).unwrap();
        assert_eq!(reloaded.paths.logs_dir, config.paths.logs_dir);
    }

    #[test]
    fn ensure_directories_creates_all_outputs() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            paths: PathsConfig {
                mpd_dir: dir.path().join("mpd"),
                hls_dir: dir.path().join("hls"),
                logs_dir: dir.path().join("logs"),
            },
            ..Config::default()
        };
        config.ensure_directories().unwrap();
        assert!(dir.path().join("mpd").is_dir());
        assert!(dir.path().join("hls").is_dir());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn source_url_and_host() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let service = &config.services[0];
        assert_eq!(service.source_url("alpha"), "rtmp://origin.example.com/live/alpha");
        assert_eq!(service.rtmp_host(), "origin.example.com");
    }
}
