//! HTTP transport and notification persistence for the issue notifier.

mod http;
mod notifications;

pub use http::{
    is_retryable_status, is_retryable_transport, HttpTransport, RateLimiter, RequestRate,
    RetryPolicy, TransportConfig, TransportError, TransportResponse,
};
pub use notifications::{
    MemoryNotificationStore, NotificationStore, PgNotificationStore, StoreError,
};

pub const CRATE_NAME: &str = "notifier-storage";
