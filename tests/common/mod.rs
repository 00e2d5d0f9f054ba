//! Shared scaffolding for the loopback end-to-end tests.

use malrs::{Context, TransportConfig};

/// Binds a context on a free loopback port, retrying a few times to ride
/// out the pick-then-bind race.
pub fn bind_context() -> Context {
    malrs::telemetry::init();
    for _ in 0..16 {
        let port = free_port();
        if let Ok(ctx) = Context::bind("127.0.0.1", port, TransportConfig::default()) {
            return ctx;
        }
    }
    panic!("could not bind a loopback context");
}

fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .expect("loopback bind")
        .local_addr()
        .expect("local addr")
        .port()
}
