//! CLI `doctor` command: check configuration and the port registry.

use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use warden::config::{default_config_path, WardenConfig};
use warden::ports::PortRegistry;

pub fn doctor(config: &WardenConfig) -> Result<()> {
    let config_path = default_config_path();
    let registry_path = config.resolved_registry_path();

    println!("Warden Health Report");
    println!("====================");
    println!();
    println!(
        "Config file:       {} ({})",
        config_path.display(),
        if config_path.exists() { "found" } else { "defaults" }
    );
    println!();
    println!("Worker:");
    println!("  Command:         {} {}", config.worker.command, config.worker.args.join(" "));
    match find_executable(&config.worker.command) {
        Some(path) => println!("  Resolved:        {}", path.display()),
        None => println!("  WARNING: command not found on PATH"),
    }
    println!("  Grace timeout:   {} ms", config.worker.grace_timeout_ms);
    println!("  Max restarts:    {}", config.worker.max_restarts);
    println!();
    println!("Control plane:");
    let port = config.control_plane.port;
    let free = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok();
    println!(
        "  Port {port}:        {}",
        if free { "available" } else { "in use (is warden already running?)" }
    );
    println!();

    let registry = PortRegistry::from_config(&config.ports, &registry_path)
        .context("invalid port registry configuration")?;
    let leases = registry.leases().context("failed to read port registry")?;
    println!("Port registry:     {}", registry_path.display());
    println!(
        "  Range:           {}-{}",
        config.ports.range_start, config.ports.range_end
    );
    println!("  Live leases:     {}", leases.len());
    for lease in &leases {
        println!("    {:<16} port {} (pid {})", lease.service, lease.port, lease.process_id);
    }

    Ok(())
}

fn find_executable(command: &str) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}
