pub mod daily;
pub mod live;
pub mod memory;
pub mod synchronizer;

pub use daily::DailyHistory;
pub use live::{spawn_poller, LiveFeed, PollerConfig, SlotBuffer};
pub use memory::MemoryFeed;
pub use synchronizer::{FeedSynchronizer, SyncDiagnostics};
