pub mod compaction;
pub mod policy;
pub mod scheduler;

pub use compaction::{downsample, CompactionEngine, Downsampled};
pub use policy::{Maintainable, RetentionManager, RetentionSchedule, SharedMaintainable};
pub use scheduler::RetentionScheduler;
