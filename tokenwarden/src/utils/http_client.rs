use std::{sync::OnceLock, time::Duration};

use tracing::{debug, warn};

/// Idle connections kept per host; the peer is a single local server.
const POOL_MAX_IDLE_PER_HOST: usize = 4;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the `reqwest::Client` used to talk to the remote peer.
///
/// The peer lives on a loopback address, so system/env proxies are bypassed.
/// No client-wide timeout is set: the long-held poll request must be allowed
/// to stay open, and callers set per-request timeouts instead.
pub fn build_peer_client(connect_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

    if connect_timeout > Duration::ZERO {
        builder = builder.connect_timeout(connect_timeout);
    }

    builder.build().unwrap_or_else(|error| {
        warn!(
            error = %error,
            "Failed to create peer HTTP client; falling back to reqwest defaults"
        );
        reqwest::Client::new()
    })
}
