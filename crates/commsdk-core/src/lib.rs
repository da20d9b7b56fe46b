//! Communication session core: calls, encrypted messaging and video capture
//! behind one session façade.
//!
//! The host builds a [`SessionLifecycleManager`] with a session transport, a
//! record store and optionally a capture device, logs in, and drives calls,
//! messages and capture through the component handles it exposes. Results come
//! back through single-fire [`Pending`] completions; progress and stall events
//! through the [`EventBus`].

pub mod call;
pub mod capture;
pub mod completion;
pub mod config;
pub mod content_store;
pub mod error;
pub mod events;
pub mod keys;
pub mod link;
pub mod messaging;
pub mod records;
pub mod session;
pub mod transport;

pub use call::{CallState, CallStateMachine, EndReason};
pub use capture::CaptureSessionManager;
pub use completion::Pending;
pub use config::CoreConfig;
pub use content_store::ContentStore;
pub use error::{CallError, CaptureError, CoreError, KeyError, RetrieveError, SubmitError, TransportError};
pub use events::{EventBus, EventHandler, Notification};
pub use keys::KeyTrustManager;
pub use messaging::MessagingPipeline;
pub use records::{MemoryRecordStore, RecordStore};
pub use session::{LoginResult, SessionBuilder, SessionLifecycleManager};

/// Install a `tracing` fmt subscriber for hosts that have none.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
