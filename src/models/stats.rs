//! Wire types of the external stats API and the aggregated summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-channel response of the stats API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelStats {
    pub is_live: bool,
    pub viewers: u64,
    pub duration: u64,
    pub bitrate: u64,
    pub last_bitrate: u64,
    pub start_time: Option<DateTime<Utc>>,
    /// Host currently serving the stream, when the API reports one
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveEntry {
    pub app: String,
    pub channel: String,
    pub protocol: String,
}

/// Response of the channel listing endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelList {
    pub channels: Vec<String>,
    pub live: Vec<LiveEntry>,
}

impl ChannelList {
    /// Distinct stream names live under `app`, sorted.
    pub fn roster(&self, app: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = self.channels.iter().cloned().collect();
        names.extend(
            self.live
                .iter()
                .filter(|entry| entry.app == app)
                .map(|entry| entry.channel.clone()),
        );
        names.into_iter().filter(|n| !n.is_empty()).collect()
    }
}

/// A viewer session supplied by the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub app: String,
    pub channel: String,
    pub protocol: String,
    pub connect_id: String,
    pub connect_created: DateTime<Utc>,
    pub connect_updated: DateTime<Utc>,
    pub bytes: u64,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherSummary {
    pub connect_id: String,
    pub connect_created: DateTime<Utc>,
    pub connect_updated: DateTime<Utc>,
    pub bytes: u64,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberSummary {
    pub connect_id: String,
    pub connect_created: DateTime<Utc>,
    pub connect_updated: DateTime<Utc>,
    pub bytes: u64,
    pub ip: String,
    pub protocol: String,
}

/// One running task of a channel together with the viewers watching it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: String,
    pub publisher: PublisherSummary,
    pub subscribers: Vec<SubscriberSummary>,
}

/// Channels grouped under one application (delivery protocol)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSummary {
    pub app: String,
    pub channels: Vec<ChannelSummary>,
}
