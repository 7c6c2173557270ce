use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;

use flowguard_runtime::{Config, Coordinator, Service};

/// Serves newline-delimited JSON requests on stdin until end of input.
fn main() -> anyhow::Result<()> {
    flowguard_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let coordinator = Arc::new(Coordinator::builder(config).build().context("failed to build coordinator")?);
    coordinator.start().context("failed to start workers")?;

    tracing::info!(node_id = %coordinator.node_id(), "flowguard node ready; reading requests from stdin");

    let service = Service::new(coordinator.clone());
    let result = serve(&service);

    coordinator.shutdown();
    result
}

fn serve(service: &Service) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        writeln!(stdout, "{}", service.handle_json(&line))?;
        stdout.flush()?;
    }
    Ok(())
}
