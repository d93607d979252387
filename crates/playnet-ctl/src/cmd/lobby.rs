//! Lobby registry commands. These map the machine-wide segment directly;
//! no daemon is involved.

use anyhow::{Context, Result};
use serde::Serialize;

use playnet_core::config::PlaynetConfig;
use playnet_core::{ConnectionSettings, PlayerName, SessionDescriptor};
use playnet_services::providers::UDP_PROVIDER;
use playnet_services::{LobbyAppEntry, PlayError, SharedAppRegistry};

use super::print_json;

fn open(config: &PlaynetConfig) -> Result<SharedAppRegistry> {
    SharedAppRegistry::open(&config.lobby)
        .with_context(|| format!("failed to open lobby segment {}", config.lobby.segment_path().display()))
}

fn parse_app(raw: &str) -> Result<u32> {
    raw.parse().with_context(|| format!("application id must be a number, got {raw:?}"))
}

fn state(entry: &LobbyAppEntry) -> String {
    let mut parts = Vec::new();
    if entry.has_settings {
        parts.push("settings");
    }
    if entry.settings_read {
        parts.push("read");
    }
    if entry.waiting_for_settings {
        parts.push("waiting");
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(",")
    }
}

pub fn cmd_lobby_list(config: &PlaynetConfig, json: bool) -> Result<()> {
    let registry = open(config)?;
    let apps = registry.lobby_apps()?;

    if json {
        return print_json(&apps);
    }

    if apps.is_empty() {
        println!("No lobbied applications.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Lobbied Applications ({})", apps.len());
    println!("  Arena blocks in use: {}", registry.used_blocks()?);
    println!("═══════════════════════════════════════");
    for app in &apps {
        println!("  {:>10}  notify {:#04x}  {}", app.app_id, app.notify.0, state(app));
    }
    Ok(())
}

pub fn cmd_lobby_register(config: &PlaynetConfig, app: &str, event: Option<&str>) -> Result<()> {
    let app_id = parse_app(app)?;
    let event = event
        .map(|e| e.parse::<u64>().context("event handle must be a number"))
        .transpose()?
        .unwrap_or(0);
    open(config)?.register_lobby_app(app_id, event)?;
    println!("✓ Registered application {app_id}");
    Ok(())
}

pub fn cmd_lobby_unregister(config: &PlaynetConfig, app: &str) -> Result<()> {
    let app_id = parse_app(app)?;
    open(config)?.unregister_lobby_app(app_id)?;
    println!("✓ Unregistered application {app_id}");
    Ok(())
}

pub fn cmd_lobby_show(config: &PlaynetConfig, app: &str, json: bool) -> Result<()> {
    let entry = open(config)?.is_lobbied(parse_app(app)?)?;
    if json {
        return print_json(&entry);
    }
    println!("  Application : {}", entry.app_id);
    println!("  Event       : {}", entry.receive_event);
    println!("  Notify      : {:#04x}", entry.notify.0);
    println!("  State       : {}", state(&entry));
    Ok(())
}

/// Store settings that launch `app` into a session named `session_name`.
pub fn cmd_lobby_set(
    config: &PlaynetConfig,
    app: &str,
    session_name: &str,
    player: &str,
    host: bool,
) -> Result<()> {
    let app_id = parse_app(app)?;
    let mut session = SessionDescriptor::new(
        config.session.application_id,
        session_name,
        config.session.max_players,
    );
    if !config.session.password.is_empty() {
        session.password = Some(config.session.password.clone());
    }
    let settings = ConnectionSettings {
        flags: if host { ConnectionSettings::HOST } else { 0 },
        session,
        player_name: Some(PlayerName::short(player)),
        service_provider: UDP_PROVIDER,
        address: config.network.broadcast.to_string().into_bytes(),
    };

    open(config)?.set_connection_settings(app_id, &settings)?;
    println!("✓ Settings stored for application {app_id} ({} bytes)", settings.encoded_len());
    Ok(())
}

#[derive(Serialize)]
struct SettingsView<'a> {
    host: bool,
    session: &'a SessionDescriptor,
    player_name: Option<&'a PlayerName>,
    service_provider: String,
    address: String,
}

pub fn cmd_lobby_get(config: &PlaynetConfig, app: &str, json: bool) -> Result<()> {
    let app_id = parse_app(app)?;
    let registry = open(config)?;

    // Ask for the size first, then fetch with exactly that much room.
    let bytes = match registry.get_connection_settings(app_id, 0) {
        Err(PlayError::BufferTooSmall { required }) => registry.get_connection_settings(app_id, required)?,
        other => other?,
    };
    let settings = ConnectionSettings::decode(&bytes).context("stored settings are malformed")?;

    let view = SettingsView {
        host: settings.is_host(),
        session: &settings.session,
        player_name: settings.player_name.as_ref(),
        service_provider: settings.service_provider.to_string(),
        address: String::from_utf8_lossy(&settings.address).into_owned(),
    };
    if json {
        return print_json(&view);
    }

    println!("  Session   : {} ({})", view.session.name, view.session.instance_id);
    println!("  App       : {}", view.session.application_id);
    println!("  Role      : {}", if view.host { "host" } else { "join" });
    if let Some(name) = view.player_name {
        println!("  Player    : {}", name.short);
    }
    println!("  Provider  : {}", view.service_provider);
    println!("  Address   : {}", view.address);
    Ok(())
}
