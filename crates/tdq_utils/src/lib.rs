pub mod atomic;
pub mod clock;
pub mod decay;
pub mod error;
pub mod exit;
pub mod id_generator;
pub mod log_assert;
pub mod net_async;
pub mod net_protocol;
pub mod payload_signature;
pub mod retry;
pub mod server_shutdown;
pub mod time;
pub mod timeout_future;

/// Version of the queue protocol, reported to clients through the queue version endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
