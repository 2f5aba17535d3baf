//! Connections manifest: the file the daemon and CLI load connection
//! definitions from.
//!
//! ```yaml
//! connections:
//!   - id: 6f1c2d1e-8d55-4c35-9d1b-0c4f7a0d9a11
//!     tenant_id: 0b8e4a52-3c7e-4d7c-8f52-3f0e1d2c4b5a
//!     name: team-notes
//!     connector_type: local_files
//!     settings: { root: /srv/notes, extensions: [md] }
//!     schedule: "*/15 * * * *"
//!     dag:
//!       stages:
//!         - name: chunk
//!           op: { kind: text_chunker, field: content, max_chars: 1200 }
//!     credentials_env: { token: NOTES_TOKEN }
//! ```

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tributary_core::{Connection, ConnectionId, Credentials, DagSpec, TenantId};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub connections: Vec<ManifestConnection>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestConnection {
    /// Stable id so restarts update the same connection (and keep its cursor).
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub connector_type: String,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub dag: DagSpec,
    /// 5-field UTC cron expression.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub force_full_sync: bool,
    /// Credential key -> environment variable holding its value. Secrets stay
    /// out of the manifest.
    #[serde(default)]
    pub credentials_env: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse YAML (`.yaml`/`.yml`) or JSON (anything else).
    pub fn parse(text: &str, path: &Path) -> anyhow::Result<Self> {
        let v: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                let y: serde_yaml::Value = serde_yaml::from_str(text)?;
                serde_json::to_value(y)?
            }
            _ => serde_json::from_str(text)?,
        };
        let manifest: Self = serde_json::from_value(v)?;

        let mut seen = HashSet::new();
        for c in &manifest.connections {
            if !seen.insert(c.id) {
                anyhow::bail!("connection {} declared twice", c.id);
            }
        }
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read manifest {}", path.display()))?;
        Self::parse(&text, path).with_context(|| format!("parse manifest {}", path.display()))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ManifestConnection> {
        self.connections.iter().find(|c| c.id == id)
    }
}

impl ManifestConnection {
    pub fn to_connection(&self) -> tributary_core::Result<Connection> {
        let mut conn = Connection::new(
            self.tenant_id,
            self.name.as_str(),
            self.connector_type.as_str(),
            self.settings.clone(),
        )?
        .with_dag(self.dag.clone());
        conn.id = self.id;
        if let Some(expr) = &self.schedule {
            conn = conn.with_schedule(expr)?;
        }
        conn.enabled = self.enabled;
        conn.force_full_sync = self.force_full_sync;
        conn.touch(Utc::now());
        Ok(conn)
    }

    /// Resolve `credentials_env` through `lookup` (normally `std::env::var`).
    pub fn credentials(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Credentials> {
        let mut creds = Credentials::default();
        for (key, var) in &self.credentials_env {
            let value = lookup(var).with_context(|| {
                format!("connection {}: env var {var} for '{key}' is not set", self.id)
            })?;
            creds = creds.with(key.as_str(), value);
        }
        Ok(creds)
    }
}
