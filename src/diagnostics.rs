//! Stderr diagnostics initialization.
//!
//! Controlled by `WARDEN_LOG` (an `EnvFilter` directive, e.g. `debug` or
//! `warden=trace`):
//! - unset → no-op (tracing disabled, zero overhead)
//! - set → JSON events to stderr
//!
//! These diagnostics are for humans debugging warden itself; the durable
//! audit trail is the JSONL streams under `logs/`.

use tracing_subscriber::EnvFilter;

/// Initialize stderr diagnostics based on `WARDEN_LOG`.
pub fn init() {
    let Ok(directive) = std::env::var("WARDEN_LOG") else {
        return;
    };
    if directive.is_empty() {
        return;
    }

    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init();
}
