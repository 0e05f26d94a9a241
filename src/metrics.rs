//! Prometheus metrics, registered on the default registry and exposed by
//! the RPC server at /metrics.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

pub static PEERS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cbc_peers_connected", "Currently connected peers").expect("metric")
});

pub static HEADERS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("cbc_headers_accepted_total", "Headers accepted into the index")
        .expect("metric")
});

pub static ORPHAN_POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("cbc_orphan_pool_size", "Orphan headers currently cached").expect("metric")
});

pub static REORGS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("cbc_reorgs_total", "Active-chain reorganizations").expect("metric")
});

pub static TIP_HEIGHT: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("cbc_tip_height", "Active chain tip height").expect("metric"));

pub static PEERS_DISCOURAGED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("cbc_peers_discouraged_total", "Peers discouraged for misbehavior")
        .expect("metric")
});

pub static MESSAGES_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("cbc_p2p_messages_received_total", "P2P messages received")
        .expect("metric")
});

pub static UNKNOWN_COMMANDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("cbc_p2p_unknown_commands_total", "Unknown P2P commands ignored")
        .expect("metric")
});

/// Render the default registry in text exposition format.
pub fn gather_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
