//! FFmpeg argument construction for every process role in a pipeline.

use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::config::PackagingConfig;
use crate::models::task::{PackageFormat, Preset};
use crate::utils::UrlUtils;

/// What a spawned transcoder process does within its generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Ingest,
    Transfer,
    Encode,
    Package(PackageFormat),
}

impl ProcessRole {
    /// Prefix of the per-process diagnostic log file
    pub fn log_prefix(&self) -> &'static str {
        match self {
            ProcessRole::Ingest => "create-pipe-stream",
            ProcessRole::Transfer => "transfer-stream",
            ProcessRole::Encode => "encode-stream",
            ProcessRole::Package(PackageFormat::Mpd) => "convert-mpd",
            ProcessRole::Package(PackageFormat::Hls) => "convert-hls",
        }
    }

    /// Whether the process reads the upstream stream on stdin
    pub fn reads_stdin(&self) -> bool {
        !matches!(self, ProcessRole::Ingest)
    }

    /// Whether the process emits a stream on stdout for downstream consumers
    pub fn writes_stdout(&self) -> bool {
        matches!(self, ProcessRole::Ingest | ProcessRole::Encode)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Ingest => f.write_str("ingest"),
            ProcessRole::Transfer => f.write_str("transfer"),
            ProcessRole::Encode => f.write_str("encode"),
            ProcessRole::Package(format) => write!(f, "package-{format}"),
        }
    }
}

/// Builds argument vectors; the binary path is supplied by the launcher.
#[derive(Debug, Clone, Default)]
pub struct FFmpegCommandBuilder {
    packaging: PackagingConfig,
}

impl FFmpegCommandBuilder {
    pub fn new(packaging: PackagingConfig) -> Self {
        Self { packaging }
    }

    /// Connects to the live source and re-emits it as FLV on stdout.
    pub fn ingest_args(&self, source_url: &str) -> Vec<String> {
        debug!("Building ingest command for {}", UrlUtils::obfuscate_credentials(source_url));
        let mut args = Vec::new();
        self.add_log_level(&mut args);
        args.extend(["-re", "-i", source_url].map(String::from));
        self.add_copy_codecs(&mut args);
        args.extend(["-f", "flv", "-"].map(String::from));
        args
    }

    /// Remuxes stdin to `url` without re-encoding.
    pub fn transfer_args(&self, url: &str) -> Vec<String> {
        let mut args = Vec::new();
        self.add_log_level(&mut args);
        self.add_stdin_input(&mut args);
        self.add_copy_codecs(&mut args);
        args.extend(["-f", "flv", url].map(String::from));
        args
    }

    /// Re-encodes stdin with `preset` and emits FLV on stdout.
    pub fn encode_args(&self, preset: &Preset) -> Vec<String> {
        let mut args = Vec::new();
        self.add_log_level(&mut args);
        self.add_stdin_input(&mut args);
        args.push("-vf".to_string());
        args.push(format!("scale=-2:{},fps=fps={}", preset.scale, preset.fps));
        args.extend(["-c:v", "libx264", "-preset"].map(String::from));
        args.push(preset.preset.clone());
        args.extend(["-tune", "zerolatency", "-crf"].map(String::from));
        args.push(preset.crf.to_string());
        args.push("-maxrate".to_string());
        args.push(format!("{}k", preset.video_bitrate));
        args.push("-bufsize".to_string());
        args.push(format!("{}k", preset.video_bitrate));
        args.extend(["-acodec", "aac", "-strict", "experimental", "-b:a"].map(String::from));
        args.push(format!("{}k", preset.audio_bitrate));
        args.extend(["-f", "flv", "-"].map(String::from));
        args
    }

    /// Segments stdin into `output_dir` with a bounded rolling window.
    pub fn package_args(&self, format: PackageFormat, output_dir: &Path) -> Vec<String> {
        let mut args = Vec::new();
        self.add_log_level(&mut args);
        args.push("-y".to_string());
        self.add_stdin_input(&mut args);
        self.add_copy_codecs(&mut args);
        args.push("-f".to_string());
        args.push(format.muxer().to_string());

        let segment = self.packaging.segment_duration.to_string();
        let window = self.packaging.window_size.to_string();
        match format {
            PackageFormat::Mpd => {
                args.extend(["-seg_duration".to_string(), segment]);
                args.extend(["-window_size".to_string(), window.clone()]);
                args.extend(["-extra_window_size".to_string(), window]);
                args.extend(["-remove_at_exit", "1"].map(String::from));
            }
            PackageFormat::Hls => {
                args.extend(["-hls_time".to_string(), segment]);
                args.extend(["-hls_list_size".to_string(), window]);
                args.extend(["-hls_flags", "delete_segments"].map(String::from));
            }
        }

        args.push(output_dir.join(format.manifest()).to_string_lossy().into_owned());
        args
    }

    /// Level-tagged, repeated lines so the per-process log keeps everything
    fn add_log_level(&self, args: &mut Vec<String>) {
        args.extend(["-loglevel", "repeat+level+debug"].map(String::from));
    }

    fn add_stdin_input(&self, args: &mut Vec<String>) {
        args.extend(["-re", "-i", "-"].map(String::from));
    }

    fn add_copy_codecs(&self, args: &mut Vec<String>) {
        args.extend(["-vcodec", "copy", "-acodec", "copy"].map(String::from));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn builder() -> FFmpegCommandBuilder {
        FFmpegCommandBuilder::new(PackagingConfig {
            segment_duration: 2,
            window_size: 6,
        })
    }

    fn joined(args: Vec<String>) -> String {
        args.join(" ")
    }

    #[test]
    fn ingest_reads_source_and_writes_flv_to_stdout() {
        assert_eq!(
            joined(builder().ingest_args("rtmp://origin/live/alpha")),
            "-loglevel repeat+level+debug -re -i rtmp://origin/live/alpha -vcodec copy -acodec copy -f flv -"
        );
    }

    #[test]
    fn transfer_copies_stdin_to_url() {
        assert_eq!(
            joined(builder().transfer_args("rtmp://relay/live/alpha")),
            "-loglevel repeat+level+debug -re -i - -vcodec copy -acodec copy -f flv rtmp://relay/live/alpha"
        );
    }

    #[test]
    fn encode_applies_preset() {
        let preset = Preset {
            scale: 720,
            fps: 30,
            preset: "veryfast".into(),
            crf: 23,
            video_bitrate: 2500,
            audio_bitrate: 128,
        };
        assert_eq!(
            joined(builder().encode_args(&preset)),
            "-loglevel repeat+level+debug -re -i - -vf scale=-2:720,fps=fps=30 -c:v libx264 -preset veryfast -tune zerolatency \
             -crf 23 -maxrate 2500k -bufsize 2500k -acodec aac -strict experimental -b:a 128k -f flv -"
        );
    }

    #[test]
    fn package_bounds_the_window() {
        let dash = builder().package_args(PackageFormat::Mpd, &PathBuf::from("mpd/abc"));
        let dash = joined(dash);
        assert!(dash.starts_with("-loglevel repeat+level+debug -y -re -i - -vcodec copy -acodec copy -f dash"));
        assert!(dash.contains("-window_size 6"));
        assert!(dash.ends_with("mpd/abc/index.mpd"));

        let hls = joined(builder().package_args(PackageFormat::Hls, &PathBuf::from("hls/abc")));
        assert!(hls.contains("-f hls -hls_time 2 -hls_list_size 6 -hls_flags delete_segments"));
        assert!(hls.ends_with("hls/abc/index.m3u8"));
    }

    #[test]
    fn every_role_logs_at_debug_level() {
        let b = builder();
        let preset = Preset {
            scale: 480,
            fps: 25,
            preset: "fast".into(),
            crf: 28,
            video_bitrate: 1000,
            audio_bitrate: 96,
        };
        for args in [
            b.ingest_args("rtmp://o/live/a"),
            b.transfer_args("rtmp://r/live/a"),
            b.encode_args(&preset),
            b.package_args(PackageFormat::Mpd, &PathBuf::from("mpd/a")),
            b.package_args(PackageFormat::Hls, &PathBuf::from("hls/a")),
        ] {
            assert_eq!(args[..2], ["-loglevel", "repeat+level+debug"]);
        }
    }

    #[test]
    fn role_metadata() {
        assert_eq!(ProcessRole::Ingest.log_prefix(), "create-pipe-stream");
        assert_eq!(ProcessRole::Package(PackageFormat::Hls).log_prefix(), "convert-hls");
        assert!(!ProcessRole::Ingest.reads_stdin());
        assert!(ProcessRole::Encode.writes_stdout());
        assert!(!ProcessRole::Transfer.writes_stdout());
        assert_eq!(ProcessRole::Package(PackageFormat::Mpd).to_string(), "package-mpd");
    }
}
