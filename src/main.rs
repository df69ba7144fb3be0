//! archbench: echo server on one of the benchmarked architectures.
//!
//! Every request payload is sent back unchanged. Useful for poking a
//! running architecture with an external load generator.

use archbench::config::Config;
use archbench::{Architecture, NoopTimeLogger, RequestContext, Responder};
use std::sync::Arc;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = %config.port,
        architecture = %config.architecture,
        async_workers = config.options.async_workers,
        backlog = config.options.backlog,
        "Starting archbench echo server"
    );

    let server = Arc::new(echo_server(&config));
    server.start()?;

    let signal_target = Arc::clone(&server);
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        signal_target.close();
    })?;

    server.await_termination();
    info!("Server stopped");
    Ok(())
}

fn echo_server(config: &Config) -> Box<dyn archbench::Server> {
    let handler = |ctx: RequestContext, payload: Vec<u8>, responder: Responder<Vec<u8>>| {
        trace!(client = %ctx.client_ip, len = payload.len(), "Echo");
        responder.respond(payload);
    };
    let architecture: Architecture = config.architecture;
    architecture.server_with_options::<Vec<u8>, Vec<u8>, _>(
        config.port,
        config.options.clone(),
        Arc::new(NoopTimeLogger),
        handler,
    )
}
