use crate::entities::models::Entity;
use crate::Result;
use std::sync::Arc;

/// Read-only view of the lineage a stage is running in.
pub struct StageContext<'a> {
    pub(crate) stage: &'a str,
    pub(crate) root: &'a Entity,
    pub(crate) ancestors: Vec<(&'a str, &'a [Entity])>,
}

impl<'a> StageContext<'a> {
    pub fn stage(&self) -> &str {
        self.stage
    }

    /// The normalized source entity this lineage started from.
    pub fn root(&self) -> &Entity {
        self.root
    }

    /// Outputs of an ancestor stage for the same source record.
    pub fn upstream_outputs(&self, stage: &str) -> Option<&[Entity]> {
        self.ancestors
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, out)| *out)
    }
}

/// One transformation step.
///
/// Stages are synchronous and must be deterministic: identical input and
/// configuration produce identical output. They cannot reach destination stores.
pub trait Stage: Send + Sync {
    fn apply(&self, input: &Entity, ctx: &StageContext<'_>) -> Result<Vec<Entity>>;
}

/// Builds custom stages referenced by `StageKind::Custom { handler, .. }`.
pub trait StageFactory: Send + Sync {
    fn handler(&self) -> &'static str;

    fn build(&self, config: &serde_json::Value) -> Result<Arc<dyn Stage>>;
}
