pub mod doctor;

use anyhow::{Context, Result};

use warden::config::WardenConfig;
use warden::ports::PortRegistry;

fn open_registry(config: &WardenConfig) -> Result<PortRegistry> {
    PortRegistry::from_config(&config.ports, config.resolved_registry_path())
        .context("invalid port registry configuration")
}

/// Print every live lease. Stale leases are pruned on the way.
pub fn ports_list(config: &WardenConfig) -> Result<()> {
    let registry = open_registry(config)?;
    let leases = registry.leases().context("failed to read port registry")?;

    if leases.is_empty() {
        println!("No live leases in {}", registry.path().display());
        return Ok(());
    }

    println!("{:<20} {:>6} {:>8}  UPDATED", "SERVICE", "PORT", "PID");
    for lease in leases {
        println!(
            "{:<20} {:>6} {:>8}  {}",
            lease.service,
            lease.port,
            lease.process_id,
            lease.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn ports_discover(config: &WardenConfig, service: &str) -> Result<()> {
    let registry = open_registry(config)?;
    match registry.discover(service).context("failed to read port registry")? {
        Some(lease) => println!("{}", lease.port),
        None => anyhow::bail!("no live lease for service '{service}'"),
    }
    Ok(())
}

pub fn ports_release(config: &WardenConfig, service: &str) -> Result<()> {
    let registry = open_registry(config)?;
    if registry.release(service).context("failed to update port registry")? {
        println!("Released lease for {service}");
    } else {
        println!("Nothing released for {service} (absent or held by a live process)");
    }
    Ok(())
}
