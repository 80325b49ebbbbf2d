//! Logging for the bridge
//!
//! Uses `tracing` for structured events. `init` installs a
//! `tracing-subscriber` formatter once per process; embedders with their own
//! subscriber simply never call it.

use girder_config::BridgeConfig;
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive
pub const LOG_ENV: &str = "GIRDER_LOG";

static INIT: OnceCell<bool> = OnceCell::new();

/// Install the global subscriber from `[logging]` settings
///
/// `GIRDER_LOG` overrides the configured level. Returns false if another
/// subscriber was already installed. Later calls are no-ops.
pub fn init(config: &BridgeConfig) -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_directive(config.log_level())));

        let builder = fmt().with_env_filter(filter).with_target(true);
        let installed = if config.log_json() {
            builder.json().try_init()
        } else {
            builder.compact().try_init()
        };
        installed.is_ok()
    })
}

fn default_directive(level: &str) -> String {
    format!("girder_runtime={}", level)
}

/// Log entry into a native call
#[inline]
pub fn log_native_call(function: &str, native_args: usize) {
    tracing::debug!(
        target: "girder_runtime::ffi",
        event = "native_call",
        function,
        native_args,
        "calling native function"
    );
}

/// Log return from a native call
#[inline]
pub fn log_native_return(function: &str, raised: bool) {
    tracing::debug!(
        target: "girder_runtime::ffi",
        event = "native_return",
        function,
        raised,
        "native function returned"
    );
}

/// Log a slot conversion
#[inline]
pub fn log_marshaled(function: &str, role: &dyn std::fmt::Display, ty: &dyn std::fmt::Display) {
    tracing::trace!(
        target: "girder_runtime::marshal",
        function,
        role = %role,
        ty = %ty,
        "marshaled slot"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[test]
    fn test_default_directive_targets_crate() {
        assert_eq!(default_directive("warn"), "girder_runtime=warn");
    }

    struct CountEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for CountEvents {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_helpers_pass_default_filter() {
        let events = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(default_directive("trace")))
            .with(CountEvents(Arc::clone(&events)));

        tracing::subscriber::with_default(subscriber, || {
            log_native_call("add", 2);
            log_native_return("add", false);
            log_marshaled("add", &"argument 'a'", &"int32");
        });
        assert_eq!(events.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = BridgeConfig::default();
        let first = init(&config);
        assert_eq!(init(&config), first);
    }
}
