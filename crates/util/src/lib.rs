pub mod async_runtime;
pub mod redact;
pub mod retry;

pub use async_runtime::block_on_future;
pub use redact::{REDACTED, is_sensitive_key, redact_env_value, redact_sensitive};
pub use retry::{RetryPolicy, retry_with_backoff};
