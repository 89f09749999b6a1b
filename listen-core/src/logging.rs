//! Tracing setup

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Directives applied on top of `RUST_LOG`
const DEFAULT_DIRECTIVES: &[&str] = &[
    "listen_core=debug",
    "listen_node=debug",
    "webrtc=warn",
    "webrtc_ice=warn",
    "webrtc_sctp=warn",
    "webrtc_dtls=warn",
    "tungstenite=info",
    "tokio_tungstenite=info",
    "hyper_util=off",
    "reqwest=off",
    "hyper=off",
];

/// Install the global subscriber (once per process)
pub fn init() {
    TRACING_INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env();
        for directive in DEFAULT_DIRECTIVES {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }

        // Another subscriber may already be installed by the embedding app
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
