//! Declarative tasks attached to a channel.
//!
//! A channel's task list decides which processes hang off its ingest stream.
//! Each variant carries exactly the fields its process needs, so a `Transfer`
//! can never be missing its URLs and an `Encode` always names a preset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Segmenting output formats understood by the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Mpd,
    Hls,
}

impl PackageFormat {
    /// Manifest file written inside the channel's output directory
    pub fn manifest(&self) -> &'static str {
        match self {
            PackageFormat::Mpd => "index.mpd",
            PackageFormat::Hls => "index.m3u8",
        }
    }

    /// Transcoder muxer name
    pub fn muxer(&self) -> &'static str {
        match self {
            PackageFormat::Mpd => "dash",
            PackageFormat::Hls => "hls",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageFormat::Mpd => "mpd",
            PackageFormat::Hls => "hls",
        }
    }
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named bundle of transcoding parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Output height; width follows the source aspect ratio
    pub scale: u32,
    pub fps: u32,
    /// x264 speed preset, e.g. `veryfast`
    pub preset: String,
    pub crf: u32,
    /// kbps
    #[serde(alias = "vBitrate")]
    pub video_bitrate: u32,
    /// kbps
    #[serde(alias = "aBitrate")]
    pub audio_bitrate: u32,
}

/// A single task attached to a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Record the ingest stream into one file per directory
    Write { paths: Vec<PathBuf> },
    /// Relay the ingest stream verbatim to every URL
    Transfer {
        #[serde(alias = "hosts")]
        urls: Vec<String>,
    },
    /// Transcode with a named preset, then relay the result to every URL
    Encode {
        preset: String,
        #[serde(alias = "hosts")]
        urls: Vec<String>,
    },
    /// Segment the ingest stream into a manifest plus rolling segments
    Package { format: PackageFormat },
}

/// Values substituted into task URL templates when a channel is created
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub name: String,
    pub app: String,
    pub origin: String,
}

impl TemplateContext {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{name}", &self.name)
            .replace("{app}", &self.app)
            .replace("{origin}", &self.origin)
    }
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Write { .. } => "write",
            Task::Transfer { .. } => "transfer",
            Task::Encode { .. } => "encode",
            Task::Package { .. } => "package",
        }
    }

    /// True when the task would not start anything: relays with no destinations.
    pub fn is_noop(&self) -> bool {
        match self {
            Task::Write { paths } => paths.is_empty(),
            Task::Transfer { urls } | Task::Encode { urls, .. } => urls.is_empty(),
            Task::Package { .. } => false,
        }
    }

    /// Copy of this task with URL placeholders filled in.
    pub fn resolve(&self, ctx: &TemplateContext) -> Task {
        match self {
            Task::Transfer { urls } => Task::Transfer {
                urls: urls.iter().map(|u| ctx.render(u)).collect(),
            },
            Task::Encode { preset, urls } => Task::Encode {
                preset: preset.clone(),
                urls: urls.iter().map(|u| ctx.render(u)).collect(),
            },
            other => other.clone(),
        }
    }
}
