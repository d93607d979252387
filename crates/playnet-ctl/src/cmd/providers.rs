//! Service-provider listing.

use std::ops::ControlFlow;

use anyhow::Result;

use playnet_core::config::PlaynetConfig;
use playnet_services::ProviderCatalogue;

use super::print_json;

pub fn cmd_providers(config: &PlaynetConfig, json: bool) -> Result<()> {
    let catalogue = ProviderCatalogue::new(&config.providers);
    let mut providers = Vec::new();
    catalogue.enumerate(|p| {
        providers.push(p.clone());
        ControlFlow::Continue(())
    });

    if json {
        return print_json(&providers);
    }

    for p in &providers {
        println!("  {}  {} v{}.{}", p.guid, p.name, p.major_version, p.minor_version);
    }
    Ok(())
}
