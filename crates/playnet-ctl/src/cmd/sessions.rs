//! One-shot session enumeration.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use playnet_core::config::PlaynetConfig;
use playnet_core::wire::DiscoveryQuery;
use playnet_core::{Guid, SessionDescriptor};
use playnet_services::node::NodeSettings;
use playnet_services::{EnumEvent, Node, NodeRole, UdpTransport};

use super::print_json;

#[derive(Serialize)]
struct ListedSession {
    #[serde(flatten)]
    descriptor: SessionDescriptor,
    source: SocketAddr,
}

pub async fn cmd_sessions(config: &PlaynetConfig, application: Option<Guid>, json: bool) -> Result<()> {
    let transport = UdpTransport::bind(SocketAddr::new(config.network.bind, 0), config.network.broadcast)
        .context("failed to bind discovery socket")?;
    let socket = transport.socket();
    let node = Arc::new(Node::new(Arc::new(transport), NodeRole::Client, NodeSettings::from(config))?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let receiver = tokio::spawn(node.clone().run_receiver(socket, shutdown_rx));

    let query = DiscoveryQuery::for_application(application.unwrap_or(config.session.application_id));
    let mut found = Vec::new();
    node.enum_sessions(&query, config.discovery.timeout(), |event| {
        if let EnumEvent::Session(entry) = event {
            found.push(ListedSession {
                descriptor: entry.descriptor.clone(),
                source: entry.source,
            });
        }
        ControlFlow::Continue(())
    })
    .await?;

    let _ = shutdown_tx.send(());
    let _ = receiver.await;

    if json {
        return print_json(&found);
    }

    if found.is_empty() {
        println!("No sessions found on {}.", config.network.broadcast);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Sessions ({})", found.len());
    println!("═══════════════════════════════════════");
    for s in &found {
        let d = &s.descriptor;
        let max = if d.max_players == 0 {
            "∞".to_string()
        } else {
            d.max_players.to_string()
        };
        println!("  ┌─ {}", d.name);
        println!("  │  instance : {}", d.instance_id);
        println!("  │  app      : {}", d.application_id);
        println!("  │  players  : {}/{}", d.current_players, max);
        println!("  │  flags    : {:#06x}", d.flags.0);
        println!("  └─ host     : {}", s.source);
    }

    Ok(())
}
