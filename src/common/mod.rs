// 公共模块

pub mod progress_tracker;

pub use progress_tracker::ProgressTracker;
