/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
use std::time::Duration;

// Transcoder
pub const DEFAULT_FFMPEG_PATH: &str = "/usr/bin/ffmpeg";

// Output directories
pub const DEFAULT_MPD_DIR: &str = "mpd";
pub const DEFAULT_HLS_DIR: &str = "hls";
pub const DEFAULT_LOGS_DIR: &str = "logs";

// Supervision
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(10);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(30);

// Packaging window
pub const DEFAULT_SEGMENT_DURATION_SECS: u32 = 4;
pub const DEFAULT_WINDOW_SIZE: u32 = 5;

// Stats push
pub const DEFAULT_STATS_PUSH_INTERVAL: Duration = Duration::from_secs(10);

// Environment overrides
pub const ENV_PREFIX: &str = "RELAY_WORKER_";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
