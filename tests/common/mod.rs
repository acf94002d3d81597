#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command as TokioCommand;

use relay_worker::config::{PackagingConfig, PathsConfig, ServiceConfig};
use relay_worker::models::stats::{ChannelList, ChannelStats};
use relay_worker::models::task::Preset;
use relay_worker::services::{
    FFmpegCommandBuilder, PipelineBuilder, ProcessLauncher, ProcessRole, ProcessSpec, StatsSource,
};

pub const LONG_RUNNING: &str = "while :; do echo frame; sleep 0.05; done";
pub const SINK: &str = "cat > /dev/null";
/// Touches the manifest path (last argument) so tests can see the directory was ready.
pub const PACKAGER: &str = r#"for last; do :; done; touch "$last"; cat > /dev/null"#;

/// Runs each role as a small `sh` program and records every spawn.
#[derive(Clone)]
pub struct ScriptedLauncher {
    scripts: HashMap<ProcessRole, String>,
    spawned: Arc<Mutex<Vec<ProcessSpec>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        let mut scripts = HashMap::new();
        scripts.insert(ProcessRole::Ingest, LONG_RUNNING.to_string());
        scripts.insert(ProcessRole::Transfer, SINK.to_string());
        scripts.insert(ProcessRole::Encode, "cat".to_string());
        scripts.insert(
            ProcessRole::Package(relay_worker::models::PackageFormat::Mpd),
            PACKAGER.to_string(),
        );
        scripts.insert(
            ProcessRole::Package(relay_worker::models::PackageFormat::Hls),
            PACKAGER.to_string(),
        );
        Self {
            scripts,
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with(mut self, role: ProcessRole, script: &str) -> Self {
        self.scripts.insert(role, script.to_string());
        self
    }

    pub fn spawned(&self) -> Vec<ProcessSpec> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawned_roles(&self) -> Vec<ProcessRole> {
        self.spawned().into_iter().map(|s| s.role).collect()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn command(&self, spec: &ProcessSpec) -> TokioCommand {
        self.spawned.lock().unwrap().push(spec.clone());
        let script = self.scripts.get(&spec.role).cloned().unwrap_or_else(|| "exit 0".to_string());
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg(script).arg("sh").args(&spec.args);
        cmd
    }
}

pub struct Workspace {
    pub dir: TempDir,
    pub paths: PathsConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig {
            mpd_dir: dir.path().join("mpd"),
            hls_dir: dir.path().join("hls"),
            logs_dir: dir.path().join("logs"),
        };
        for d in [&paths.mpd_dir, &paths.hls_dir, &paths.logs_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        Self { dir, paths }
    }

    pub fn builder(&self, launcher: Arc<dyn ProcessLauncher>) -> Arc<PipelineBuilder> {
        let mut presets = BTreeMap::new();
        presets.insert(
            "720p".to_string(),
            Preset {
                scale: 720,
                fps: 30,
                preset: "veryfast".into(),
                crf: 23,
                video_bitrate: 2500,
                audio_bitrate: 128,
            },
        );
        Arc::new(PipelineBuilder::new(
            launcher,
            FFmpegCommandBuilder::new(PackagingConfig::default()),
            presets,
            self.paths.clone(),
            Duration::from_secs(2),
        ))
    }

    pub fn log_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.paths.logs_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("timed out waiting for the future")
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// In-memory stats API
#[derive(Default)]
pub struct FakeStats {
    live: Mutex<HashMap<String, bool>>,
    roster: Mutex<Option<Vec<String>>>,
    pub stats_calls: Mutex<usize>,
}

impl FakeStats {
    pub fn set_live(&self, name: &str, live: bool) {
        self.live.lock().unwrap().insert(name.to_string(), live);
    }

    pub fn set_roster(&self, names: &[&str]) {
        *self.roster.lock().unwrap() = Some(names.iter().map(|n| n.to_string()).collect());
    }
}

#[async_trait]
impl StatsSource for FakeStats {
    async fn channel_stats(&self, _service: &ServiceConfig, name: &str) -> Option<ChannelStats> {
        *self.stats_calls.lock().unwrap() += 1;
        let live = *self.live.lock().unwrap().get(name)?;
        Some(ChannelStats {
            is_live: live,
            ..ChannelStats::default()
        })
    }

    async fn channel_list(&self, _service: &ServiceConfig) -> Option<ChannelList> {
        self.roster.lock().unwrap().clone().map(|channels| ChannelList {
            channels,
            live: vec![],
        })
    }
}
