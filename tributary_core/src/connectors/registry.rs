use crate::connectors::traits::ConnectorFactory;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Connector factories keyed by type string.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip(self, factory), fields(connector_type = factory.connector_type()))]
    pub async fn register(&self, factory: Arc<dyn ConnectorFactory>) -> Result<()> {
        let key = factory.connector_type().to_string();
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("connector_type is empty".to_string()));
        }
        let mut factories = self.factories.write().await;
        if factories.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "connector '{key}' already registered"
            )));
        }
        factories.insert(key, factory);
        Ok(())
    }

    pub async fn get(&self, connector_type: &str) -> Result<Arc<dyn ConnectorFactory>> {
        self.factories
            .read()
            .await
            .get(connector_type)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("connector '{connector_type}' not registered")))
    }

    pub async fn types(&self) -> Vec<String> {
        self.factories.read().await.keys().cloned().collect()
    }
}
