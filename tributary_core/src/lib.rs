//! Tributary core library: models, traits and engines for the multi-tenant
//! sync pipeline.
//!
//! Source connectors feed raw records through the normalizer and a per-connection
//! transformer DAG; the cursor decides what changed since the last committed run
//! and the destination writer commits vectors and graph nodes before advancing it.

pub mod config;
pub mod connectors;
pub mod cursor;
pub mod destinations;
pub mod entities;
pub mod error;
pub mod models;
pub mod o11y;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod transform;

pub use config::SyncConfig;
pub use connectors::models::{Checkpoint, ConnectorCapabilities, Credentials, RawRecord};
pub use connectors::registry::ConnectorRegistry;
pub use connectors::traits::{
    ConnectorFactory, CredentialProvider, RecordStream, SourceConnector, StaticCredentials,
};
pub use cursor::models::{CursorEntry, CursorMutation, SyncAction};
pub use cursor::traits::CursorStore;
pub use destinations::traits::{Embedder, GraphStore, VectorStore};
pub use destinations::writer::{CommitCounts, Destinations};
pub use entities::models::{Breadcrumb, Entity, EntityKey, FieldValue};
pub use entities::schema::{EntitySchema, FieldKind, FieldSpec, SchemaRegistry};
pub use error::{Error, ErrorClass, Result};
pub use models::{ConnectionId, JobId, ListQuery, TenantId};
pub use retry::RetryPolicy;
pub use sync::events::JobEvent;
pub use sync::models::{
    Connection, CronSchedule, JobError, JobQuery, JobStats, JobStatus, SyncCheckpoint, SyncJob,
    SyncMode, TriggerKind,
};
pub use sync::orchestrator::SyncOrchestrator;
pub use sync::schedule::SyncScheduler;
pub use sync::traits::SyncStore;
pub use transform::models::{DagSpec, StageKind, StageSpec};
pub use transform::traits::{Stage, StageContext, StageFactory};
