pub mod engine;
pub mod monitor;
pub mod pipeline;

pub use engine::{BackupOptions, Engine};
pub use monitor::Monitor;
