//! `portbridge namespaces` / `portbridge services` - browse the cluster.

use anyhow::{bail, Result};
use portbridge_core::forward::ClusterDiscovery;

use crate::deps;

fn discovery() -> Result<ClusterDiscovery> {
    match deps::locate_helpers().kubectl {
        Some(kubectl) => Ok(ClusterDiscovery::new(kubectl)),
        None => bail!("kubectl not found; install it or add it to PATH"),
    }
}

pub async fn namespaces(json: bool) -> Result<()> {
    let namespaces = discovery()?.fetch_namespaces().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&namespaces)?);
        return Ok(());
    }

    for ns in &namespaces {
        println!("{}", ns.name);
    }
    Ok(())
}

pub async fn services(namespace: &str, json: bool) -> Result<()> {
    let services = discovery()?.fetch_services(namespace).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    if services.is_empty() {
        println!("No services in namespace '{namespace}'.");
        return Ok(());
    }

    println!("{:<28} {:<14} {}", "NAME", "TYPE", "PORTS");
    for svc in &services {
        let ports = svc
            .ports
            .iter()
            .map(|p| p.display_name())
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<28} {:<14} {}", svc.name, svc.service_type, ports);
    }
    Ok(())
}
