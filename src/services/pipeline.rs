//! Pipeline generations: one ingest process plus everything fed from it.
//!
//! The wiring is kept as an explicit graph of producer/consumer edges. A
//! member that exits kills all of its producers up to the ingest process, and
//! the ingest process ending tears down the whole generation, so no process
//! outlives the ingest attempt it belongs to. When the ingest process exits on
//! its own, whatever it already wrote is delivered to its consumers before the
//! teardown.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, PathsConfig};
use crate::errors::{PipelineError, PipelineResult};
use crate::models::channel::{Channel, RunningTask};
use crate::models::task::{PackageFormat, Preset, Task};
use crate::services::ffmpeg_command_builder::{FFmpegCommandBuilder, ProcessRole};
use crate::services::ffmpeg_wrapper::{
    MemberOutcome, ProcessLauncher, ProcessSpec, SpawnedProcess, StreamTee, TeeOutput,
    spawn_process, wait_or_kill,
};
use crate::utils::UrlUtils;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Ingest { source_url: String },
    Transfer { url: String },
    Encode { preset: String },
    Package { format: PackageFormat, dir: PathBuf },
    /// Recording file; not a process
    FileSink { path: PathBuf },
}

impl NodeKind {
    pub fn is_process(&self) -> bool {
        !matches!(self, NodeKind::FileSink { .. })
    }

    fn describe(&self) -> String {
        match self {
            NodeKind::Ingest { source_url } => {
                format!("ingest {}", UrlUtils::obfuscate_credentials(source_url))
            }
            NodeKind::Transfer { url } => format!("transfer {}", UrlUtils::obfuscate_credentials(url)),
            NodeKind::Encode { preset } => format!("encode {preset}"),
            NodeKind::Package { format, dir } => format!("package-{format} {}", dir.display()),
            NodeKind::FileSink { path } => format!("write {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineEdge {
    pub producer: NodeId,
    pub consumer: NodeId,
}

/// Data-flow graph of one generation, rooted at the ingest process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineGraph {
    nodes: Vec<PipelineNode>,
    edges: Vec<PipelineEdge>,
}

impl PipelineGraph {
    pub const ROOT: NodeId = 0;

    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            nodes: vec![PipelineNode {
                id: Self::ROOT,
                kind: NodeKind::Ingest {
                    source_url: source_url.into(),
                },
                pid: None,
            }],
            edges: Vec::new(),
        }
    }

    pub fn add(&mut self, kind: NodeKind, producer: NodeId) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(PipelineNode { id, kind, pid: None });
        self.edges.push(PipelineEdge {
            producer,
            consumer: id,
        });
        id
    }

    fn set_pid(&mut self, node: NodeId, pid: Option<u32>) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.pid = pid;
        }
    }

    pub fn nodes(&self) -> &[PipelineNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    /// Every node upstream of `node`, nearest first
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        self.walk(node, |edge| (edge.consumer, edge.producer))
    }

    /// Every node downstream of `node`
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        self.walk(node, |edge| (edge.producer, edge.consumer))
    }

    fn walk(&self, start: NodeId, direction: impl Fn(&PipelineEdge) -> (NodeId, NodeId)) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for edge in &self.edges {
                let (from, to) = direction(edge);
                if from == current && seen.insert(to) {
                    order.push(to);
                    queue.push_back(to);
                }
            }
        }
        order
    }

    pub fn process_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind.is_process()).count()
    }
}

/// Exit notification of one member
#[derive(Debug, Clone)]
struct MemberEvent {
    node: NodeId,
    outcome: MemberOutcome,
}

/// What happened to every member of a finished generation
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub generation: u64,
    pub graph: PipelineGraph,
    /// `None` only if the ingest monitor vanished without reporting
    pub ingest: Option<MemberOutcome>,
    pub outcomes: BTreeMap<NodeId, MemberOutcome>,
    /// Members that had not reported when the drain timeout elapsed
    pub unreported: Vec<NodeId>,
}

impl GenerationReport {
    pub fn outcome(&self, node: NodeId) -> Option<&MemberOutcome> {
        self.outcomes.get(&node)
    }
}

/// Builds generations from a channel's task list
pub struct PipelineBuilder {
    launcher: Arc<dyn ProcessLauncher>,
    commands: FFmpegCommandBuilder,
    presets: BTreeMap<String, Preset>,
    paths: PathsConfig,
    drain_timeout: Duration,
}

impl PipelineBuilder {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        commands: FFmpegCommandBuilder,
        presets: BTreeMap<String, Preset>,
        paths: PathsConfig,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            commands,
            presets,
            paths,
            drain_timeout,
        }
    }

    pub fn from_config(config: &Config, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::new(
            launcher,
            FFmpegCommandBuilder::new(config.packaging.clone()),
            config.presets.clone(),
            config.paths.clone(),
            config.supervisor.drain_timeout,
        )
    }

    /// Output directory of a packaging task, keyed by channel id
    pub fn package_dir(&self, format: PackageFormat, channel_id: &str) -> PathBuf {
        match format {
            PackageFormat::Mpd => self.paths.mpd_dir.join(channel_id),
            PackageFormat::Hls => self.paths.hls_dir.join(channel_id),
        }
    }

    /// Spawns the ingest process and every derived member for `generation`.
    ///
    /// Only an ingest spawn failure is returned as an error. Failures of
    /// derived members become exit events of the returned generation and
    /// trigger its cascade.
    pub async fn build(&self, channel: &Channel, generation: u64) -> PipelineResult<Generation> {
        let ingest_spec = ProcessSpec {
            role: ProcessRole::Ingest,
            args: self.commands.ingest_args(&channel.source_url),
            channel_id: channel.id.clone(),
            generation,
        };
        let ingest = spawn_process(self.launcher.as_ref(), ingest_spec, &self.paths.logs_dir)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut wiring = Wiring {
            builder: self,
            channel_id: channel.id.clone(),
            generation,
            graph: PipelineGraph::new(channel.source_url.clone()),
            teardown: CancellationToken::new(),
            ingest_ended: CancellationToken::new(),
            kills: HashMap::new(),
            events: events_tx,
            members: 0,
            tees: Vec::new(),
            running_tasks: Vec::new(),
        };

        let mut ingest_stdout = wiring.attach(PipelineGraph::ROOT, ingest, None);
        let mut ingest_outputs = Vec::new();

        for task in &channel.tasks {
            if wiring.cascade_started() && !matches!(task, Task::Write { .. }) {
                debug!(
                    "channel_id={} generation={} task={} status=skipped reason=cascade_started",
                    channel.id,
                    generation,
                    task.kind()
                );
                continue;
            }
            if task.is_noop() {
                debug!("channel_id={} task={} status=skipped reason=no_targets", channel.id, task.kind());
                continue;
            }

            match task {
                Task::Write { paths } => {
                    for dir in paths {
                        if let Some(output) = wiring.open_file_sink(&channel.name, dir).await {
                            ingest_outputs.push(output);
                        }
                    }
                }
                Task::Transfer { urls } => {
                    for url in urls {
                        if wiring.cascade_started() {
                            break;
                        }
                        if let Some(output) = wiring.spawn_transfer(url, PipelineGraph::ROOT) {
                            ingest_outputs.push(output);
                        }
                    }
                }
                Task::Encode { preset, urls } => {
                    let Some(params) = self.presets.get(preset) else {
                        warn!(
                            "channel_id={} preset={} status=skipped reason=unknown_preset",
                            channel.id, preset
                        );
                        continue;
                    };
                    if let Some(output) = wiring.spawn_encode(preset, params, urls) {
                        ingest_outputs.push(output);
                    }
                }
                Task::Package { format } => {
                    if let Some(output) = wiring.spawn_package(*format).await {
                        ingest_outputs.push(output);
                    }
                }
            }
        }

        let ingest_tee = ingest_stdout.take().map(|stdout| {
            StreamTee::spawn(
                format!("channel_id={} generation={} ingest", channel.id, generation),
                stdout,
                ingest_outputs,
                wiring.teardown.child_token(),
            )
        });

        info!(
            "channel_id={} generation={} status=pipeline_built processes={} nodes={}",
            channel.id,
            generation,
            wiring.graph.process_count(),
            wiring.graph.nodes().len()
        );

        Ok(Generation {
            number: generation,
            channel_id: wiring.channel_id,
            graph: wiring.graph,
            root_kill: wiring.kills.remove(&PipelineGraph::ROOT).unwrap_or_default(),
            teardown: wiring.teardown,
            events: events_rx,
            members: wiring.members,
            ingest_tee,
            tees: wiring.tees,
            running_tasks: wiring.running_tasks,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Mutable state while a generation is being assembled
struct Wiring<'a> {
    builder: &'a PipelineBuilder,
    channel_id: String,
    generation: u64,
    graph: PipelineGraph,
    teardown: CancellationToken,
    /// Cancelled by the ingest monitor however the ingest process ended
    ingest_ended: CancellationToken,
    kills: HashMap<NodeId, CancellationToken>,
    events: mpsc::UnboundedSender<MemberEvent>,
    members: usize,
    tees: Vec<JoinHandle<u64>>,
    running_tasks: Vec<RunningTask>,
}

impl Wiring<'_> {
    /// True once any member has exited or failed; nothing new may be spawned then.
    fn cascade_started(&self) -> bool {
        self.teardown.is_cancelled()
            || self.ingest_ended.is_cancelled()
            || self
                .kills
                .get(&PipelineGraph::ROOT)
                .is_some_and(CancellationToken::is_cancelled)
    }

    /// Tokens cancelled when `node` exits: its producers, or the ingest marker for the root.
    ///
    /// The generation teardown for a root that exited on its own is left to
    /// [`Generation::supervise`], after the ingest output has drained.
    fn cascade_targets(&self, node: NodeId) -> Vec<CancellationToken> {
        if node == PipelineGraph::ROOT {
            return vec![self.ingest_ended.clone()];
        }
        self.graph
            .ancestors(node)
            .into_iter()
            .filter_map(|id| self.kills.get(&id).cloned())
            .collect()
    }

    /// Registers a spawned process and starts its monitor. Returns its stdout.
    fn attach(
        &mut self,
        node: NodeId,
        process: SpawnedProcess,
        cleanup_dir: Option<PathBuf>,
    ) -> Option<tokio::process::ChildStdout> {
        let SpawnedProcess {
            spec,
            mut child,
            pid,
            stdin: _,
            stdout,
        } = process;
        self.graph.set_pid(node, pid);

        let kill = self.teardown.child_token();
        self.kills.insert(node, kill.clone());
        let targets = self.cascade_targets(node);
        let root_teardown = (node == PipelineGraph::ROOT).then(|| self.teardown.clone());
        let events = self.events.clone();
        self.members += 1;

        tokio::spawn(async move {
            let outcome = wait_or_kill(&mut child, &kill).await;
            for target in &targets {
                target.cancel();
            }
            if let Some(teardown) = &root_teardown
                && !matches!(outcome, MemberOutcome::Exited { .. })
            {
                teardown.cancel();
            }
            info!(
                "channel_id={} generation={} role={} pid={:?} status=exited outcome={:?}",
                spec.channel_id, spec.generation, spec.role, pid, outcome
            );
            if let Some(dir) = cleanup_dir {
                remove_output_dir(&dir).await;
            }
            let _ = events.send(MemberEvent { node, outcome });
        });

        stdout
    }

    /// Records a member that never started and cascades from it.
    fn fail(&mut self, node: NodeId, error: PipelineError) {
        warn!(
            "channel_id={} generation={} node={} status=spawn_failed error={}",
            self.channel_id, self.generation, node, error
        );
        for target in self.cascade_targets(node) {
            target.cancel();
        }
        self.members += 1;
        let _ = self.events.send(MemberEvent {
            node,
            outcome: MemberOutcome::Failed {
                message: error.to_string(),
            },
        });
    }

    fn spec(&self, role: ProcessRole, args: Vec<String>) -> ProcessSpec {
        ProcessSpec {
            role,
            args,
            channel_id: self.channel_id.clone(),
            generation: self.generation,
        }
    }

    fn spawn_member(
        &mut self,
        kind: NodeKind,
        producer: NodeId,
        spec: ProcessSpec,
        cleanup_dir: Option<PathBuf>,
    ) -> Option<(NodeId, SpawnedProcess)> {
        let node = self.graph.add(kind, producer);
        match spawn_process(self.builder.launcher.as_ref(), spec, &self.builder.paths.logs_dir) {
            Ok(process) => Some((node, process)),
            Err(e) => {
                self.fail(node, e);
                None
            }
        }
    }

    fn spawn_transfer(&mut self, url: &str, producer: NodeId) -> Option<TeeOutput> {
        let spec = self.spec(ProcessRole::Transfer, self.builder.commands.transfer_args(url));
        let kind = NodeKind::Transfer { url: url.to_string() };
        let (node, mut process) = self.spawn_member(kind, producer, spec, None)?;
        let stdin = process.stdin.take();
        self.attach(node, process, None);
        stdin.map(|s| TeeOutput::new(format!("transfer#{node}"), s))
    }

    fn spawn_encode(&mut self, preset_name: &str, preset: &Preset, urls: &[String]) -> Option<TeeOutput> {
        let spec = self.spec(ProcessRole::Encode, self.builder.commands.encode_args(preset));
        let kind = NodeKind::Encode {
            preset: preset_name.to_string(),
        };
        let (node, mut process) = self.spawn_member(kind, PipelineGraph::ROOT, spec, None)?;
        let stdin = process.stdin.take();
        let stdout = self.attach(node, process, None);

        let mut relays = Vec::new();
        for url in urls {
            if self.cascade_started() {
                break;
            }
            if let Some(output) = self.spawn_transfer(url, node) {
                relays.push(output);
            }
        }

        if let Some(stdout) = stdout {
            let tee = StreamTee::spawn(
                format!("channel_id={} generation={} encode#{node}", self.channel_id, self.generation),
                stdout,
                relays,
                self.teardown.child_token(),
            );
            self.tees.push(tee);
        }

        stdin.map(|s| TeeOutput::new(format!("encode#{node}"), s))
    }

    async fn spawn_package(&mut self, format: PackageFormat) -> Option<TeeOutput> {
        let dir = self.builder.package_dir(format, &self.channel_id);
        let kind = NodeKind::Package {
            format,
            dir: dir.clone(),
        };

        if let Err(e) = recreate_output_dir(&dir).await {
            let node = self.graph.add(kind, PipelineGraph::ROOT);
            self.fail(node, e);
            return None;
        }

        let spec = self.spec(
            ProcessRole::Package(format),
            self.builder.commands.package_args(format, &dir),
        );
        let Some((node, mut process)) = self.spawn_member(kind, PipelineGraph::ROOT, spec, None) else {
            remove_output_dir(&dir).await;
            return None;
        };

        let running = RunningTask::new(format, dir.clone());
        let counter = running.bytes.clone();
        self.running_tasks.push(running);

        let stdin = process.stdin.take();
        self.attach(node, process, Some(dir));
        stdin.map(|s| TeeOutput::new(format!("package-{format}#{node}"), s).with_counter(counter))
    }

    async fn open_file_sink(&mut self, channel_name: &str, dir: &Path) -> Option<TeeOutput> {
        let path = dir.join(format!("{}_{}.mp4", channel_name, Utc::now().timestamp_millis()));
        match tokio::fs::File::create(&path).await {
            Ok(file) => {
                let node = self.graph.add(NodeKind::FileSink { path: path.clone() }, PipelineGraph::ROOT);
                info!(
                    "channel_id={} generation={} status=recording path={}",
                    self.channel_id,
                    self.generation,
                    path.display()
                );
                Some(TeeOutput::new(format!("write#{node}"), file))
            }
            Err(e) => {
                warn!(
                    "channel_id={} status=recording_failed path={} error={}",
                    self.channel_id,
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

/// Delete-then-create so a generation never sees the previous one's segments.
async fn recreate_output_dir(dir: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(PipelineError::Directory {
                path: dir.to_path_buf(),
                source,
            });
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PipelineError::Directory {
            path: dir.to_path_buf(),
            source,
        })
}

async fn remove_output_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed output directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove output directory {}: {}", dir.display(), e),
    }
}

/// A running generation, exclusively owned by its channel supervisor
pub struct Generation {
    number: u64,
    channel_id: String,
    graph: PipelineGraph,
    root_kill: CancellationToken,
    teardown: CancellationToken,
    events: mpsc::UnboundedReceiver<MemberEvent>,
    members: usize,
    ingest_tee: Option<JoinHandle<u64>>,
    tees: Vec<JoinHandle<u64>>,
    running_tasks: Vec<RunningTask>,
    drain_timeout: Duration,
}

impl Generation {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn running_tasks(&self) -> &[RunningTask] {
        &self.running_tasks
    }

    /// Waits for the ingest process to end, then tears down every member.
    ///
    /// After a natural ingest exit its buffered output is first copied to
    /// every consumer, bounded by the drain timeout. Cancelling `terminate`
    /// kills the ingest process and tears down immediately, as does any
    /// derived member's exit.
    pub async fn supervise(mut self, terminate: &CancellationToken) -> GenerationReport {
        let mut outcomes = BTreeMap::new();
        let mut pending = self.members;

        let ingest = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(MemberEvent { node, outcome }) => {
                        pending = pending.saturating_sub(1);
                        outcomes.insert(node, outcome.clone());
                        if node == PipelineGraph::ROOT {
                            break Some(outcome);
                        }
                        debug!(
                            "channel_id={} generation={} node={} status=member_exited cascading",
                            self.channel_id, self.number, node
                        );
                    }
                    None => break None,
                },
                _ = terminate.cancelled(), if !self.root_kill.is_cancelled() => {
                    info!(
                        "channel_id={} generation={} status=terminating",
                        self.channel_id, self.number
                    );
                    self.root_kill.cancel();
                }
            }
        };

        if matches!(ingest, Some(MemberOutcome::Exited { .. })) {
            self.deliver_ingest_tail().await;
        }
        self.teardown.cancel();

        let events = &mut self.events;
        let mut tees = std::mem::take(&mut self.tees);
        tees.extend(self.ingest_tee.take());
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while pending > 0 {
                match events.recv().await {
                    Some(MemberEvent { node, outcome }) => {
                        pending -= 1;
                        outcomes.insert(node, outcome);
                    }
                    None => break,
                }
            }
            for tee in tees {
                let _ = tee.await;
            }
        })
        .await;

        let unreported: Vec<NodeId> = self
            .graph
            .nodes()
            .iter()
            .filter(|n| n.kind.is_process() && !outcomes.contains_key(&n.id))
            .map(|n| n.id)
            .collect();
        if drained.is_err() {
            warn!(
                "channel_id={} generation={} status=drain_timeout unreported={:?}",
                self.channel_id, self.number, unreported
            );
        }

        info!(
            "channel_id={} generation={} status=generation_ended ingest={:?}",
            self.channel_id, self.number, ingest
        );

        GenerationReport {
            generation: self.number,
            graph: self.graph.clone(),
            ingest,
            outcomes,
            unreported,
        }
    }
}

impl Generation {
    /// Lets the ingest tee read to end of stream so consumers get every byte.
    async fn deliver_ingest_tail(&mut self) {
        let Some(tee) = self.ingest_tee.take() else {
            return;
        };
        match tokio::time::timeout(self.drain_timeout, tee).await {
            Ok(Ok(bytes)) => debug!(
                "channel_id={} generation={} status=ingest_drained bytes={}",
                self.channel_id, self.number, bytes
            ),
            Ok(Err(e)) => warn!(
                "channel_id={} generation={} status=ingest_tee_failed error={}",
                self.channel_id, self.number, e
            ),
            Err(_) => warn!(
                "channel_id={} generation={} status=ingest_drain_timeout",
                self.channel_id, self.number
            ),
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> PipelineGraph {
        let mut graph = PipelineGraph::new("rtmp://o/live/a");
        let encode = graph.add(NodeKind::Encode { preset: "720p".into() }, PipelineGraph::ROOT);
        graph.add(NodeKind::Transfer { url: "rtmp://r1".into() }, encode);
        graph.add(NodeKind::Transfer { url: "rtmp://r2".into() }, encode);
        graph.add(
            NodeKind::FileSink {
                path: PathBuf::from("/rec/a_1.mp4"),
            },
            PipelineGraph::ROOT,
        );
        graph
    }

    #[test]
    fn ancestors_walk_up_to_ingest() {
        let graph = sample_graph();
        assert_eq!(graph.ancestors(2), vec![1, 0]);
        assert_eq!(graph.ancestors(1), vec![0]);
        assert!(graph.ancestors(PipelineGraph::ROOT).is_empty());
    }

    #[test]
    fn descendants_cover_the_whole_generation_from_root() {
        let graph = sample_graph();
        assert_eq!(graph.descendants(PipelineGraph::ROOT), vec![1, 4, 2, 3]);
        assert_eq!(graph.descendants(1), vec![2, 3]);
    }

    #[test]
    fn file_sinks_are_not_processes() {
        let graph = sample_graph();
        assert_eq!(graph.process_count(), 4);
        assert_eq!(graph.edges().len(), 4);
    }

    #[tokio::test]
    async fn recreate_clears_previous_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("mpd").join("abc");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("stale.m4s"), b"old").await.unwrap();

        recreate_output_dir(&dir).await.unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join("stale.m4s").exists());

        remove_output_dir(&dir).await;
        assert!(!dir.exists());
        // already gone: still fine
        remove_output_dir(&dir).await;
    }
}
