//! The API key as an observable cell.
//!
//! Every change is published on [`Topic::CredentialChanged`]; the key itself never leaves
//! this module except as a request header.

use crate::config::Settings;
use crate::events::{EventBus, Topic};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::info;

pub struct Credentials {
    /// Process-wide override (flag or environment); wins over the stored key.
    override_key: Option<String>,
    stored: RwLock<Option<String>>,
    settings_path: Option<PathBuf>,
    bus: EventBus,
}

fn clean(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

impl Credentials {
    /// Credentials backed by the settings file at `path`.
    pub fn load(path: PathBuf, override_key: Option<String>, bus: EventBus) -> Result<Self> {
        let settings = Settings::load(&path)?;
        Ok(Self {
            override_key: clean(override_key),
            stored: RwLock::new(clean(settings.api_key)),
            settings_path: Some(path),
            bus,
        })
    }

    /// Credentials that are never persisted.
    pub fn in_memory(key: Option<String>, bus: EventBus) -> Self {
        Self {
            override_key: None,
            stored: RwLock::new(clean(key)),
            settings_path: None,
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn api_key(&self) -> Option<String> {
        if let Some(k) = &self.override_key {
            return Some(k.clone());
        }
        self.stored.read().ok().and_then(|g| g.clone())
    }

    pub fn is_present(&self) -> bool {
        self.api_key().is_some()
    }

    pub fn set(&self, key: &str) -> Result<()> {
        self.replace(clean(Some(key.to_string())))
    }

    pub fn clear(&self) -> Result<()> {
        self.replace(None)
    }

    /// Re-read the settings file, e.g. after another process changed it.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let fresh = clean(Settings::load(path)?.api_key);
        let changed = {
            let mut guard = self
                .stored
                .write()
                .map_err(|_| anyhow::anyhow!("credential lock poisoned"))?;
            let changed = *guard != fresh;
            *guard = fresh;
            changed
        };
        if changed {
            info!("stored API key changed on disk");
            self.bus.publish(Topic::CredentialChanged);
        }
        Ok(())
    }

    fn replace(&self, key: Option<String>) -> Result<()> {
        if let Some(path) = &self.settings_path {
            let mut settings = Settings::load(path)?;
            settings.api_key = key.clone();
            settings.save(path)?;
        }
        {
            let mut guard = self
                .stored
                .write()
                .map_err(|_| anyhow::anyhow!("credential lock poisoned"))?;
            *guard = key;
        }
        self.bus.publish(Topic::CredentialChanged);
        Ok(())
    }
}
