//! Development fixtures for running without a database.

use anyhow::{Context, Result};
use lib_signage::models::{ContentDescriptor, Device};
use lib_signage::store::InMemoryStore;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedMonitor {
    pub token: String,
    #[serde(flatten)]
    pub device: Device,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub monitors: Vec<SeedMonitor>,
    #[serde(default)]
    pub contents: Vec<ContentDescriptor>,
}

impl Seed {
    pub fn from_file(path: &Path) -> Result<Seed> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    pub fn into_store(self) -> InMemoryStore {
        let monitors = self.monitors.len();
        let contents = self.contents.len();
        let store = self
            .monitors
            .into_iter()
            .fold(InMemoryStore::new(), |store, m| store.with_device(m.token, m.device));
        let store = self
            .contents
            .into_iter()
            .fold(store, |store, c| store.with_content(c));
        info!(monitors, contents, "In-memory store seeded");
        store
    }
}
