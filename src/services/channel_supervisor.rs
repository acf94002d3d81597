//! Per-channel supervision loop.
//!
//! ```text
//! Idle -> Running(1) -> Backoff -> Running(2) -> ... -> Stopped
//! ```
//!
//! `Stopped` is terminal and only reached through [`SupervisorHandle::stop`]
//! or [`SupervisorHandle::shutdown`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::channel::Channel;
use crate::services::pipeline::{GenerationReport, PipelineBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running { generation: u64 },
    Backoff { attempt: u32, delay: Duration },
    Stopped,
}

/// Delay before the next attempt after `attempts` finished ones
pub fn backoff_delay(step: Duration, attempts: u32) -> Duration {
    step.saturating_mul(attempts)
}

pub struct ChannelSupervisor {
    channel: Arc<Channel>,
    builder: Arc<PipelineBuilder>,
    backoff_step: Duration,
    stop: CancellationToken,
    terminate: CancellationToken,
    state: watch::Sender<SupervisorState>,
    reports: Option<tokio::sync::mpsc::UnboundedSender<GenerationReport>>,
}

/// Control surface of a running supervisor
#[derive(Debug)]
pub struct SupervisorHandle {
    channel_id: String,
    stop: CancellationToken,
    terminate: CancellationToken,
    state: watch::Receiver<SupervisorState>,
    task: JoinHandle<()>,
}

impl ChannelSupervisor {
    pub fn new(channel: Arc<Channel>, builder: Arc<PipelineBuilder>, backoff_step: Duration) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            channel,
            builder,
            backoff_step,
            stop: CancellationToken::new(),
            terminate: CancellationToken::new(),
            state,
            reports: None,
        }
    }

    /// Forwards every finished generation's report to `tx`.
    pub fn with_reports(mut self, tx: tokio::sync::mpsc::UnboundedSender<GenerationReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Starts the loop on the runtime and returns its handle.
    pub fn start(self) -> SupervisorHandle {
        let channel_id = self.channel.id.clone();
        let stop = self.stop.clone();
        let terminate = self.terminate.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        SupervisorHandle {
            channel_id,
            stop,
            terminate,
            state,
            task,
        }
    }

    async fn run(self) {
        let channel = &self.channel;
        info!(
            "channel_id={} name={} source={} status=supervisor_started",
            channel.id,
            channel.name,
            crate::utils::UrlUtils::obfuscate_credentials(&channel.source_url)
        );
        let mut generation = 0u64;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            generation += 1;
            self.state.send_replace(SupervisorState::Running { generation });

            match self.builder.build(channel, generation).await {
                Ok(running) => {
                    channel.set_running_tasks(running.running_tasks().to_vec()).await;
                    let report = running.supervise(&self.terminate).await;
                    if let Some(tx) = &self.reports {
                        let _ = tx.send(report);
                    }
                }
                Err(e) => {
                    warn!(
                        "channel_id={} generation={} status=ingest_spawn_failed error={}",
                        channel.id, generation, e
                    );
                }
            }

            channel.clear_running_tasks().await;
            let attempts = channel.record_attempt();

            if self.stop.is_cancelled() {
                break;
            }

            let delay = backoff_delay(self.backoff_step, attempts);
            info!(
                "channel_id={} connect_attempts={} status=backoff delay={}",
                channel.id,
                attempts,
                humantime::format_duration(delay)
            );
            self.state.send_replace(SupervisorState::Backoff {
                attempt: attempts,
                delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => break,
            }
        }

        self.state.send_replace(SupervisorState::Stopped);
        info!("channel_id={} status=supervisor_stopped", channel.id);
    }
}

impl SupervisorHandle {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Cooperative stop: the current generation runs until its ingest process ends.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and kill the current generation's ingest process.
    pub fn shutdown(&self) {
        self.stop.cancel();
        self.terminate.cancel();
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("channel_id={} status=supervisor_panicked error={}", self.channel_id, e);
        }
    }
}
