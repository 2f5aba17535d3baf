use crate::entities::models::{Breadcrumb, EntityKey};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Opaque resume point handed back to a connector's `extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub value: serde_json::Value,
}

impl Checkpoint {
    #[tracing::instrument(level = "debug", skip(value))]
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}

/// A raw record produced by a source connector.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Schema discriminator; must match a declared `EntitySchema`.
    pub entity_type: String,
    /// Stable identifier in the external system.
    pub entity_id: String,
    /// Connector-defined payload; expected to be a JSON object.
    pub payload: serde_json::Value,
    /// Ancestors, root first.
    pub breadcrumbs: Vec<Breadcrumb>,
    /// Safe resume point: everything before and including this record has been emitted.
    pub checkpoint: Option<Checkpoint>,
    /// The record still exists but has not changed since the `since` checkpoint.
    /// Carries no payload; see [`ConnectorCapabilities::lists_unchanged`].
    pub unchanged: bool,
}

impl RawRecord {
    #[tracing::instrument(level = "debug", skip(payload))]
    pub fn new(
        entity_type: impl Into<String> + std::fmt::Debug,
        entity_id: impl Into<String> + std::fmt::Debug,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let entity_type = entity_type.into();
        if entity_type.trim().is_empty() {
            return Err(Error::InvalidInput(
                "raw record entity_type is empty".to_string(),
            ));
        }
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "raw record entity_id is empty".to_string(),
            ));
        }
        Ok(Self {
            entity_type,
            entity_id,
            payload,
            breadcrumbs: Vec::new(),
            checkpoint: None,
            unchanged: false,
        })
    }

    /// Marker for a record that is still present at the source but unchanged
    /// since the checkpoint the run started from.
    pub fn unchanged(
        entity_type: impl Into<String> + std::fmt::Debug,
        entity_id: impl Into<String> + std::fmt::Debug,
    ) -> Result<Self> {
        let mut record = Self::new(entity_type, entity_id, serde_json::Value::Null)?;
        record.unchanged = true;
        Ok(record)
    }

    pub fn with_breadcrumbs(mut self, breadcrumbs: Vec<Breadcrumb>) -> Self {
        self.breadcrumbs = breadcrumbs;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectorCapabilities {
    /// `extract(Some(checkpoint))` returns only records changed since the checkpoint.
    pub supports_incremental: bool,
    /// Incremental runs still report every live record, emitting
    /// [`RawRecord::unchanged`] markers for the ones that did not change, so
    /// removals can be detected without a full run.
    #[serde(default)]
    pub lists_unchanged: bool,
}

/// Already-issued credentials handed to a connector factory.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub values: std::collections::BTreeMap<String, String>,
}

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}
