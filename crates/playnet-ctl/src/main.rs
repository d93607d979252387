//! playnet-ctl — command-line tools for session discovery and the lobby table.

use anyhow::{Context, Result};

use playnet_core::config::PlaynetConfig;
use playnet_core::Guid;

mod cmd;

fn print_usage() {
    println!("Usage: playnet-ctl [--json] [--app <guid>] <command>");
    println!();
    println!("Commands:");
    println!("  sessions                               Enumerate sessions on the local segment");
    println!("  providers                              List configured service providers");
    println!("  lobby list                             List lobbied applications");
    println!("  lobby register <app> [event]           Add an application to the lobby table");
    println!("  lobby unregister <app>                 Remove an application and its settings");
    println!("  lobby show <app>                       Show one application's lobby state");
    println!("  lobby set <app> <session> <player> [--host]");
    println!("                                         Store connection settings for an application");
    println!("  lobby get <app>                        Read an application's connection settings");
    println!();
    println!("Options:");
    println!("  --json          Machine-readable output");
    println!("  --app <guid>    Application to enumerate (default: from config)");
    println!();
    println!("Config is read from $PLAYNET_CONFIG or ~/.config/playnet/config.toml.");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut json = false;
    let mut host = false;
    let mut application: Option<Guid> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--json" => json = true,
            "--host" => host = true,
            "--app" => {
                i += 1;
                application = Some(
                    args.get(i)
                        .context("--app requires a value")?
                        .parse()
                        .context("--app must be a GUID")?,
                );
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    let config = PlaynetConfig::load().context("failed to load config")?;

    match remaining.as_slice() {
        ["sessions"] | []                       => cmd::sessions::cmd_sessions(&config, application, json).await,
        ["providers"]                           => cmd::providers::cmd_providers(&config, json),
        ["lobby"] | ["lobby", "list"]           => cmd::lobby::cmd_lobby_list(&config, json),
        ["lobby", "register", app]              => cmd::lobby::cmd_lobby_register(&config, app, None),
        ["lobby", "register", app, event]       => cmd::lobby::cmd_lobby_register(&config, app, Some(*event)),
        ["lobby", "unregister", app]            => cmd::lobby::cmd_lobby_unregister(&config, app),
        ["lobby", "show", app]                  => cmd::lobby::cmd_lobby_show(&config, app, json),
        ["lobby", "set", app, session, player]  => cmd::lobby::cmd_lobby_set(&config, app, session, player, host),
        ["lobby", "get", app]                   => cmd::lobby::cmd_lobby_get(&config, app, json),
        ["help"] | ["--help"] | ["-h"]          => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
