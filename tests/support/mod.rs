#![allow(dead_code)]

pub mod mech;
pub mod server;

/// Initializes `env_logger` once; set `RUST_LOG=http_negotiate=trace` to see
/// the negotiation.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
