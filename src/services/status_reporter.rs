use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::channel::ChannelSnapshot;
use crate::services::channel_registry::RegistryReader;
use crate::utils::human_format::{format_bytes, format_duration};

/// Logs a block describing every online channel on a fixed interval
pub struct StatusReporter {
    registry: RegistryReader,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(registry: RegistryReader, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut status_interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = status_interval.tick() => {}
            }

            let channels = self.registry.snapshot().await;
            if channels.is_empty() {
                continue;
            }
            for line in render_report(&channels) {
                info!("{}", line);
            }
        }
    }
}

pub fn render_report(channels: &[ChannelSnapshot]) -> Vec<String> {
    let now = Utc::now();
    let mut lines = vec![
        "=== Channel Status Report ===".to_string(),
        format!("Online channels: {}", channels.len()),
    ];

    for channel in channels {
        let uptime = (now - channel.created_at).to_std().unwrap_or_default();
        lines.push(format!(
            "  Channel {}: {} | Service: {} | Up: {} | Attempts: {} | Tasks: {}",
            channel.id,
            channel.name,
            channel.service,
            format_duration(uptime),
            channel.connect_attempts,
            channel.tasks.len()
        ));
        for task in &channel.running_tasks {
            lines.push(format!(
                "    {} {} | Rx: {}",
                task.protocol,
                task.path.display(),
                format_bytes(task.bytes)
            ));
        }
    }

    lines.push("=== End Channel Status ===".to_string());
    lines
}
