//! playnetd — hosts a session or browses for them on the local segment.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use playnet_core::config::PlaynetConfig;
use playnet_core::wire::DiscoveryQuery;
use playnet_core::{PlayerName, SessionDescriptor};
use playnet_services::node::NodeSettings;
use playnet_services::{EnumEvent, Node, NodeRole, UdpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PlaynetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PlaynetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PlaynetConfig::default()
    });

    let host = config.session.host;
    tracing::info!(host, application = %config.session.application_id, "playnetd starting");

    // Hosts listen on the well-known port; browsers take any port and hear
    // replies there.
    let port = if host { config.network.port } else { 0 };
    let transport = UdpTransport::bind(SocketAddr::new(config.network.bind, port), config.network.broadcast)
        .context("failed to bind session socket")?;
    let socket = transport.socket();
    tracing::info!(addr = %transport.local_addr()?, broadcast = %config.network.broadcast, "socket bound");

    let role = if host {
        let mut session = SessionDescriptor::new(
            config.session.application_id,
            config.session.name.clone(),
            config.session.max_players,
        );
        if !config.session.password.is_empty() {
            session.password = Some(config.session.password.clone());
        }
        NodeRole::Host(session)
    } else {
        NodeRole::Client
    };

    let node = Arc::new(Node::new(Arc::new(transport), role, NodeSettings::from(&config))?);

    // First configured provider carries the connection.
    let mut provider = None;
    node.providers().enumerate(|p| {
        provider = Some(p.guid);
        ControlFlow::Break(())
    });
    if let Some(guid) = provider {
        node.initialize_connection(&guid)?;
    }

    if host {
        let id = node.create_server_player(PlayerName::short(config.session.name.clone()), &[])?;
        if let Some(session) = node.session() {
            tracing::info!(
                instance = %session.instance_id,
                name = %session.name,
                max_players = session.max_players,
                server_player = %id,
                "hosting session"
            );
        }
    } else {
        let query = DiscoveryQuery::for_application(config.session.application_id);
        node.broadcaster().start_async(query, config.discovery.timeout(), |event| {
            match event {
                EnumEvent::Session(entry) => tracing::info!(
                    instance = %entry.descriptor.instance_id,
                    name = %entry.descriptor.name,
                    players = entry.descriptor.current_players,
                    max = entry.descriptor.max_players,
                    source = %entry.source,
                    "  session"
                ),
                EnumEvent::TimedOut => tracing::debug!("enumeration pass complete"),
            }
            ControlFlow::Continue(())
        })?;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let receiver_task = tokio::spawn(node.clone().run_receiver(socket, shutdown_tx.subscribe()));

    let snapshot_printer = {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                if node.is_host() {
                    tracing::info!(players = node.roster().player_count(), "roster snapshot");
                    for player in node.roster().players() {
                        tracing::info!(
                            player = %player.id,
                            name = %player.name.short,
                            local = player.local,
                            "  player"
                        );
                    }
                } else {
                    let expired = node.expire_sessions();
                    tracing::info!(count = node.directory().len(), expired, "session directory snapshot");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = receiver_task       => tracing::error!("receiver exited: {:?}", r),
        r = snapshot_printer    => tracing::error!("snapshot printer exited: {:?}", r),
    }

    node.shutdown().await;
    Ok(())
}
