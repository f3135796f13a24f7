pub mod backend;
pub mod local;
pub mod retry;

pub use backend::{Backend, BackendType, ObjectInfo};
pub use local::{LocalBackend, copy_tree};
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
