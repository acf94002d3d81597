//! Read-side summary of online channels for the HTTP layer and stats push.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsPushConfig;
use crate::errors::AppResult;
use crate::models::channel::ChannelSnapshot;
use crate::models::stats::{AppSummary, ChannelSummary, PublisherSummary, Subscriber, SubscriberSummary};
use crate::services::channel_registry::RegistryReader;
use crate::utils::{TolerantHttpClient, UrlUtils};

/// Viewer sessions, owned by the HTTP layer
pub trait SubscriberSource: Send + Sync {
    fn subscribers(&self) -> Vec<Subscriber>;
}

/// For deployments without a viewer-facing HTTP layer
pub struct NoSubscribers;

impl SubscriberSource for NoSubscribers {
    fn subscribers(&self) -> Vec<Subscriber> {
        Vec::new()
    }
}

/// Groups every running task under its protocol and joins the matching viewers.
///
/// With `server` set, only channels whose source URL host equals it are included.
pub fn aggregate(
    channels: &[ChannelSnapshot],
    subscribers: &[Subscriber],
    server: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<AppSummary> {
    let mut apps: Vec<AppSummary> = Vec::new();

    for channel in channels {
        if let Some(server) = server
            && UrlUtils::host(&channel.source_url).as_deref() != Some(server)
        {
            continue;
        }

        for task in &channel.running_tasks {
            let app_name = task.protocol.as_str();
            let protocol = task.protocol.as_str();

            let viewers = subscribers
                .iter()
                .filter(|s| s.app == app_name && s.channel == channel.name && s.protocol == protocol)
                .map(|s| SubscriberSummary {
                    connect_id: s.connect_id.clone(),
                    connect_created: s.connect_created,
                    connect_updated: s.connect_updated,
                    bytes: s.bytes,
                    ip: s.ip.clone(),
                    protocol: s.protocol.clone(),
                })
                .collect();

            let entry = ChannelSummary {
                channel: channel.name.clone(),
                publisher: PublisherSummary {
                    connect_id: task.id.to_string(),
                    connect_created: task.created_at,
                    connect_updated: now,
                    bytes: task.bytes,
                    protocol: protocol.to_string(),
                },
                subscribers: viewers,
            };

            match apps.iter_mut().find(|a| a.app == app_name) {
                Some(app) => app.channels.push(entry),
                None => apps.push(AppSummary {
                    app: app_name.to_string(),
                    channels: vec![entry],
                }),
            }
        }
    }

    apps
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub stats: Vec<AppSummary>,
}

pub struct StatsAggregator {
    registry: RegistryReader,
    subscribers: Arc<dyn SubscriberSource>,
}

impl StatsAggregator {
    pub fn new(registry: RegistryReader, subscribers: Arc<dyn SubscriberSource>) -> Self {
        Self { registry, subscribers }
    }

    pub async fn summary(&self, server: Option<&str>) -> StatsPayload {
        let channels = self.registry.snapshot().await;
        let subscribers = self.subscribers.subscribers();
        StatsPayload {
            stats: aggregate(&channels, &subscribers, server, Utc::now()),
        }
    }
}

/// Periodically POSTs the summary to a collector
pub struct StatsPusher {
    aggregator: StatsAggregator,
    http: TolerantHttpClient,
    config: StatsPushConfig,
}

impl StatsPusher {
    pub fn new(aggregator: StatsAggregator, http: TolerantHttpClient, config: StatsPushConfig) -> Self {
        Self {
            aggregator,
            http,
            config,
        }
    }

    pub async fn push_once(&self) -> AppResult<()> {
        let payload = self.aggregator.summary(self.config.server.as_deref()).await;
        self.http
            .post_json(&self.config.url, &payload, &self.config.token)
            .await?;
        debug!("Pushed stats for {} apps", payload.stats.len());
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Stats push started: url={} interval={}",
            UrlUtils::obfuscate_credentials(&self.config.url),
            humantime::format_duration(self.config.interval)
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.push_once().await {
                        warn!("Stats push failed: {}", e);
                    }
                }
            }
        }
    }
}
