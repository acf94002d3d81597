//! Polling loop that maps external liveness onto channel supervisors.
//!
//! Every tick, per service: wildcard specs are resolved against the service's
//! channel list first, then each spec is checked against the stats API.
//! Channels are created when their source goes live and destroyed when it
//! goes offline; everything else is a no-op, so repeated ticks against an
//! unchanged API change nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ServiceConfig};
use crate::models::channel::{Channel, ChannelSpec};
use crate::models::stats::ChannelStats;
use crate::models::task::{Task, TemplateContext};
use crate::services::channel_registry::{ChannelRegistry, RegistryReader};
use crate::services::channel_supervisor::{ChannelSupervisor, SupervisorHandle, SupervisorState};
use crate::services::pipeline::PipelineBuilder;
use crate::services::stats_client::StatsSource;

/// Wildcard spec and the concrete specs it currently resolves to
struct WildcardState {
    spec: ChannelSpec,
    resolved: BTreeMap<String, ChannelSpec>,
}

struct ServiceState {
    config: ServiceConfig,
    concrete: Vec<ChannelSpec>,
    wildcards: Vec<WildcardState>,
}

impl ServiceState {
    fn from_config(config: ServiceConfig) -> Self {
        let mut concrete = Vec::new();
        let mut wildcards = Vec::new();
        for declared in &config.channels {
            let spec = ChannelSpec {
                id: declared
                    .id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: declared.name.clone(),
                tasks: declared.tasks.clone(),
            };
            if declared.is_wildcard() {
                wildcards.push(WildcardState {
                    spec,
                    resolved: BTreeMap::new(),
                });
            } else {
                concrete.push(spec);
            }
        }
        Self {
            config,
            concrete,
            wildcards,
        }
    }

    fn specs(&self) -> Vec<ChannelSpec> {
        self.concrete
            .iter()
            .cloned()
            .chain(self.wildcards.iter().flat_map(|w| w.resolved.values().cloned()))
            .collect()
    }
}

/// What one tick changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    pub specs_added: Vec<String>,
    pub specs_pruned: Vec<String>,
}

impl TickSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.destroyed.is_empty()
            && self.specs_added.is_empty()
            && self.specs_pruned.is_empty()
    }
}

pub struct DiscoveryLoop {
    services: Vec<ServiceState>,
    registry: ChannelRegistry,
    supervisors: HashMap<String, SupervisorHandle>,
    retiring: Vec<SupervisorHandle>,
    source: Arc<dyn StatsSource>,
    builder: Arc<PipelineBuilder>,
    backoff_step: Duration,
    poll_interval: Duration,
}

impl DiscoveryLoop {
    /// Channel ids missing from `services` are generated here, once.
    pub fn new(
        services: Vec<ServiceConfig>,
        source: Arc<dyn StatsSource>,
        builder: Arc<PipelineBuilder>,
        backoff_step: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            services: services.into_iter().map(ServiceState::from_config).collect(),
            registry: ChannelRegistry::new(),
            supervisors: HashMap::new(),
            retiring: Vec::new(),
            source,
            builder,
            backoff_step,
            poll_interval,
        }
    }

    pub fn from_config(config: &Config, source: Arc<dyn StatsSource>, builder: Arc<PipelineBuilder>) -> Self {
        Self::new(
            config.services.clone(),
            source,
            builder,
            config.supervisor.backoff_step,
            config.supervisor.poll_interval,
        )
    }

    pub fn reader(&self) -> RegistryReader {
        self.registry.reader()
    }

    /// Effective specs of a service after the latest wildcard resolution
    pub fn specs(&self, service: &str) -> Vec<ChannelSpec> {
        self.services
            .iter()
            .find(|s| s.config.name == service)
            .map(ServiceState::specs)
            .unwrap_or_default()
    }

    pub fn supervisor_state(&self, channel_id: &str) -> Option<SupervisorState> {
        self.supervisors.get(channel_id).map(SupervisorHandle::state)
    }

    pub fn supervisor(&self, channel_id: &str) -> Option<&SupervisorHandle> {
        self.supervisors.get(channel_id)
    }

    /// Polls until `shutdown` fires, then stops every supervisor.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Discovery loop started: services={} interval={}",
            self.services.len(),
            humantime::format_duration(self.poll_interval)
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if !summary.is_empty() {
                        debug!("Discovery tick: {:?}", summary);
                    }
                }
            }
        }

        self.shutdown_all().await;
        info!("Discovery loop stopped");
    }

    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();
        self.retiring.retain(|h| !h.is_finished());

        for idx in 0..self.services.len() {
            self.resolve_wildcards(idx, &mut summary).await;

            let config = self.services[idx].config.clone();
            let mut specs = self.services[idx].specs();
            specs.extend(self.orphans(&config, &specs));

            for spec in specs {
                let Some(stats) = self.source.channel_stats(&config, &spec.name).await else {
                    debug!("service={} channel={} status=no_data", config.name, spec.name);
                    continue;
                };

                let supervised = self.registry.contains(&spec.id);
                match (stats.is_live, supervised) {
                    (true, false) => {
                        if self.is_retiring(&spec.id) {
                            debug!(
                                "channel_id={} status=previous_supervisor_draining retry_next_tick",
                                spec.id
                            );
                            continue;
                        }
                        self.bring_online(&config, &spec, &stats);
                        summary.created.push(spec.id.clone());
                    }
                    (false, true) => {
                        self.take_offline(&spec.id);
                        summary.destroyed.push(spec.id.clone());
                    }
                    _ => {}
                }
            }
        }

        summary
    }

    /// Re-resolves every wildcard of one service against a fresh roster.
    async fn resolve_wildcards(&mut self, idx: usize, summary: &mut TickSummary) {
        if self.services[idx].wildcards.is_empty() {
            return;
        }
        let config = self.services[idx].config.clone();
        let Some(list) = self.source.channel_list(&config).await else {
            warn!("service={} status=channel_list_unavailable keeping previous resolution", config.name);
            return;
        };
        let roster: BTreeSet<String> = list.roster(&config.app).into_iter().collect();

        for wildcard in &mut self.services[idx].wildcards {
            wildcard.resolved.retain(|name, spec| {
                let keep = roster.contains(name);
                if !keep {
                    info!("service={} spec={} status=wildcard_pruned", config.name, spec.id);
                    summary.specs_pruned.push(spec.id.clone());
                }
                keep
            });
            for name in &roster {
                if !wildcard.resolved.contains_key(name) {
                    let spec = ChannelSpec::resolved_from(&wildcard.spec, name);
                    info!("service={} spec={} status=wildcard_resolved", config.name, spec.id);
                    summary.specs_added.push(spec.id.clone());
                    wildcard.resolved.insert(name.clone(), spec);
                }
            }
        }
    }

    /// A stopped supervisor for `id` still tearing down its last generation.
    fn is_retiring(&self, id: &str) -> bool {
        self.retiring
            .iter()
            .any(|h| h.channel_id() == id && !h.is_finished())
    }

    /// Online channels of this service whose spec no longer exists.
    fn orphans(&self, config: &ServiceConfig, specs: &[ChannelSpec]) -> Vec<ChannelSpec> {
        let known: BTreeSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        self.registry
            .iter()
            .filter(|c| c.service == config.name && !known.contains(c.id.as_str()))
            .map(|c| ChannelSpec {
                id: c.id.clone(),
                name: c.name.clone(),
                tasks: c.tasks.clone(),
            })
            .collect()
    }

    fn bring_online(&mut self, config: &ServiceConfig, spec: &ChannelSpec, stats: &ChannelStats) {
        let ctx = TemplateContext {
            name: spec.name.clone(),
            app: config.app.clone(),
            origin: stats.origin.clone().unwrap_or_else(|| config.rtmp_host()),
        };
        let tasks: Vec<Task> = spec.tasks.iter().map(|t| t.resolve(&ctx)).collect();
        let channel = Arc::new(Channel::new(
            spec,
            config.app.clone(),
            config.name.clone(),
            config.source_url(&spec.name),
            tasks,
        ));

        info!(
            "channel_id={} service={} name={} status=channel_went_online tasks={}",
            channel.id,
            config.name,
            channel.name,
            channel.tasks.len()
        );
        self.registry.insert(channel.clone());

        if !channel.tasks.is_empty() {
            let handle =
                ChannelSupervisor::new(channel, self.builder.clone(), self.backoff_step).start();
            self.supervisors.insert(spec.id.clone(), handle);
        }
    }

    fn take_offline(&mut self, id: &str) {
        if let Some(handle) = self.supervisors.remove(id) {
            handle.shutdown();
            self.retiring.push(handle);
        }
        if let Some(channel) = self.registry.remove(id) {
            info!(
                "channel_id={} service={} name={} status=channel_went_offline",
                channel.id, channel.service, channel.name
            );
        }
    }

    /// Stops every supervisor, waits for their loops, and empties the registry.
    pub async fn shutdown_all(&mut self) {
        let ids: Vec<String> = self.registry.iter().map(|c| c.id.clone()).collect();
        for id in &ids {
            self.take_offline(id);
        }
        for (_, handle) in self.supervisors.drain() {
            handle.shutdown();
            self.retiring.push(handle);
        }
        futures::future::join_all(self.retiring.drain(..).map(SupervisorHandle::join)).await;
    }
}
