pub mod channel;
pub mod stats;
pub mod task;

pub use channel::{Channel, ChannelSnapshot, ChannelSpec, RunningTask, RunningTaskSnapshot};
pub use stats::{ChannelList, ChannelStats, Subscriber};
pub use task::{PackageFormat, Preset, Task, TemplateContext};
