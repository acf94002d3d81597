pub mod channel_registry;
pub mod channel_supervisor;
pub mod discovery;
pub mod ffmpeg_command_builder;
pub mod ffmpeg_wrapper;
pub mod pipeline;
pub mod stats_aggregator;
pub mod stats_client;
pub mod status_reporter;

pub use channel_registry::{ChannelRegistry, RegistryReader};
pub use channel_supervisor::{ChannelSupervisor, SupervisorHandle, SupervisorState};
pub use discovery::{DiscoveryLoop, TickSummary};
pub use ffmpeg_command_builder::{FFmpegCommandBuilder, ProcessRole};
pub use ffmpeg_wrapper::{FfmpegLauncher, MemberOutcome, ProcessLauncher, ProcessSpec};
pub use pipeline::{Generation, GenerationReport, NodeKind, PipelineBuilder, PipelineGraph};
pub use stats_aggregator::{StatsAggregator, StatsPusher, SubscriberSource};
pub use stats_client::{HttpStatsClient, StatsSource};
pub use status_reporter::StatusReporter;
