//! Liveness queries against the external stats API.

use async_trait::async_trait;

use crate::config::{ServiceConfig, ServiceKind};
use crate::models::stats::{ChannelList, ChannelStats};
use crate::utils::TolerantHttpClient;

/// Where liveness and rosters come from. `None` means "no data this tick".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn channel_stats(&self, service: &ServiceConfig, name: &str) -> Option<ChannelStats>;

    async fn channel_list(&self, service: &ServiceConfig) -> Option<ChannelList>;
}

/// Endpoint layout for each service kind
pub fn stats_url(service: &ServiceConfig, name: &str) -> String {
    let base = service.stats_base.trim_end_matches('/');
    match service.kind {
        ServiceKind::KlpqStream => format!(
            "{}/channels/{}/{}/{}",
            base,
            service.rtmp_host(),
            service.app,
            name
        ),
        ServiceKind::Simple => format!("{base}/{name}"),
    }
}

pub fn list_url(service: &ServiceConfig) -> Option<String> {
    match service.kind {
        ServiceKind::KlpqStream => Some(format!(
            "{}/channels/list",
            service.stats_base.trim_end_matches('/')
        )),
        ServiceKind::Simple => None,
    }
}

pub struct HttpStatsClient {
    http: TolerantHttpClient,
}

impl HttpStatsClient {
    pub fn new(http: TolerantHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl StatsSource for HttpStatsClient {
    async fn channel_stats(&self, service: &ServiceConfig, name: &str) -> Option<ChannelStats> {
        self.http.get_json(&stats_url(service, name)).await
    }

    async fn channel_list(&self, service: &ServiceConfig) -> Option<ChannelList> {
        let url = list_url(service)?;
        self.http.get_json(&url).await
    }
}
