//! Hostname map rendering and atomic publication.
//!
//! The published file is a flat `map` table for the edge proxy, one `hostname tag;` entry per
//! line, sorted by hostname:
//!
//! ```text
//! # Generated by tenantctl; do not edit.
//! forum1.example.com forum1;
//! www.mysite.org wiki22;
//! ```

use anyhow::Context;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::db::models::tenants::Tenant;

const HEADER: &str = "# Generated by tenantctl; do not edit.\n";

/// Hostname to tag mapping for every active tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    entries: BTreeMap<String, String>,
}

impl RoutingTable {
    /// Build from tenant records; removed tenants never appear.
    pub fn from_tenants<'a>(tenants: impl IntoIterator<Item = &'a Tenant>) -> Self {
        let entries = tenants
            .into_iter()
            .filter(|t| !t.is_removed())
            .map(|t| (t.hostname.clone(), t.tag.clone()))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<&str> {
        self.entries.get(hostname).map(String::as_str)
    }

    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        for (hostname, tag) in &self.entries {
            out.push_str(hostname);
            out.push(' ');
            out.push_str(tag);
            out.push_str(";\n");
        }
        out
    }
}

/// Replace `path` with `contents` in one rename.
///
/// The temporary file is created next to the target so the rename never crosses filesystems;
/// readers see either the previous table or the new one.
pub async fn publish(path: &Path, contents: String) -> anyhow::Result<()> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, contents.as_bytes()))
        .await
        .context("routing map writer panicked")?
}

fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create routing map directory: {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary routing map in {}", dir.display()))?;
    tmp.write_all(contents).context("Failed to write temporary routing map")?;
    tmp.as_file().sync_all().context("Failed to flush temporary routing map")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move routing map into place: {}", path.display()))?;
    Ok(())
}
