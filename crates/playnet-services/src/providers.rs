//! Service-provider catalogue.
//!
//! Providers are listed in the config file. When none are listed the
//! built-in UDP provider is offered on its own.

use std::ops::ControlFlow;

use parking_lot::Mutex;

use playnet_core::config::ProviderConfig;
use playnet_core::Guid;

use crate::error::{PlayError, PlayResult};

/// GUID of the built-in UDP provider.
pub const UDP_PROVIDER: Guid = Guid([
    0x3a, 0x82, 0x6e, 0x9c, 0x5e, 0x41, 0x4b, 0x1f, 0x8d, 0x0e, 0x70, 0x6c, 0x61, 0x79, 0x75, 0x64,
]);

pub fn builtin_udp() -> ProviderConfig {
    ProviderConfig {
        guid: UDP_PROVIDER,
        name: "Playnet UDP".to_string(),
        major_version: 1,
        minor_version: 0,
    }
}

pub struct ProviderCatalogue {
    providers: Vec<ProviderConfig>,
    initialized: Mutex<Option<Guid>>,
}

impl ProviderCatalogue {
    pub fn new(configured: &[ProviderConfig]) -> Self {
        let providers = if configured.is_empty() {
            vec![builtin_udp()]
        } else {
            configured.to_vec()
        };
        Self {
            providers,
            initialized: Mutex::new(None),
        }
    }

    /// Visit providers in config order until the visitor breaks. Returns the
    /// number visited.
    pub fn enumerate<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(&ProviderConfig) -> ControlFlow<()>,
    {
        let mut visited = 0;
        for provider in &self.providers {
            visited += 1;
            if visitor(provider).is_break() {
                break;
            }
        }
        visited
    }

    pub fn find(&self, guid: &Guid) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.guid == *guid)
    }

    /// Bind this catalogue's owner to one provider. Allowed once.
    pub fn initialize_connection(&self, guid: &Guid) -> PlayResult<&ProviderConfig> {
        let provider = self
            .find(guid)
            .ok_or_else(|| PlayError::NotFound(format!("service provider {guid}")))?;
        let mut initialized = self.initialized.lock();
        if initialized.is_some() {
            return Err(PlayError::AlreadyInitialized);
        }
        *initialized = Some(*guid);
        tracing::info!(provider = %provider.name, %guid, "connection initialized");
        Ok(provider)
    }

    pub fn initialized(&self) -> Option<Guid> {
        *self.initialized.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            guid: Guid::random(),
            name: name.to_string(),
            major_version: 0,
            minor_version: 1,
        }
    }

    #[test]
    fn empty_config_offers_builtin_udp() {
        let catalogue = ProviderCatalogue::new(&[]);
        let mut names = Vec::new();
        catalogue.enumerate(|p| {
            names.push(p.name.clone());
            ControlFlow::Continue(())
        });
        assert_eq!(names, ["Playnet UDP"]);
        assert!(catalogue.find(&UDP_PROVIDER).is_some());
    }

    #[test]
    fn visitor_can_stop_early() {
        let catalogue = ProviderCatalogue::new(&[provider("a"), provider("b"), provider("c")]);
        let visited = catalogue.enumerate(|p| {
            if p.name == "b" {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn initialize_only_once() {
        let a = provider("a");
        let catalogue = ProviderCatalogue::new(&[a.clone()]);
        assert!(matches!(
            catalogue.initialize_connection(&Guid::random()),
            Err(PlayError::NotFound(_))
        ));
        assert_eq!(catalogue.initialize_connection(&a.guid).unwrap().name, "a");
        assert!(matches!(
            catalogue.initialize_connection(&a.guid),
            Err(PlayError::AlreadyInitialized)
        ));
        assert_eq!(catalogue.initialized(), Some(a.guid));
    }
}
