use std::sync::Arc;
use tributary_core::{
    Credentials, CredentialProvider, JobStatus, StaticCredentials, SyncConfig, TriggerKind,
};
use tributary_server::backends::{register_manifest, Backends};
use tributary_server::manifest::Manifest;

fn manifest_for(root: &std::path::Path) -> String {
    format!(
        r#"
connections:
  - id: 3a0f6c9e-2b1d-4f8a-9c3e-5d7b1a2e4f60
    tenant_id: 9e2d4c1b-7a3f-4e5d-8b6c-0f1a2b3c4d5e
    name: notes
    connector_type: local_files
    settings:
      root: {root}
    dag:
      stages:
        - name: chunk
          op: {{ kind: text_chunker, field: content, max_chars: 40 }}
          applies_to: [file]
    credentials_env: {{ token: NOTES_TOKEN }}
"#,
        root = root.display()
    )
}

#[tokio::test]
async fn manifest_connections_sync_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("long.md"),
        "a fairly long note that will need more than one chunk to hold it all",
    )
    .unwrap();
    let manifest = Manifest::parse(
        &manifest_for(dir.path()),
        std::path::Path::new("connections.yaml"),
    )
    .unwrap();

    let credentials = Arc::new(StaticCredentials::new());
    let orchestrator = Backends::in_memory()
        .unwrap()
        .orchestrator(SyncConfig::default(), credentials.clone())
        .await
        .unwrap();
    let conns = register_manifest(&orchestrator, &credentials, &manifest, |var| {
        (var == "NOTES_TOKEN").then(|| "t0k3n".to_string())
    })
    .await
    .unwrap();
    assert_eq!(conns.len(), 1);
    let conn = &conns[0];
    assert_eq!(
        credentials.credentials(conn.tenant_id, conn.id).await.unwrap(),
        Credentials::default().with("token", "t0k3n")
    );

    let job_id = orchestrator
        .submit_job(conn.id, TriggerKind::Manual)
        .await
        .unwrap();
    let job = orchestrator.wait_for_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    // The file itself plus at least two chunks.
    assert!(job.stats.inserted >= 3, "{:?}", job.stats);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn missing_credential_env_fails_registration() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Manifest::parse(
        &manifest_for(dir.path()),
        std::path::Path::new("connections.yml"),
    )
    .unwrap();
    let credentials = Arc::new(StaticCredentials::new());
    let orchestrator = Backends::in_memory()
        .unwrap()
        .orchestrator(SyncConfig::default(), credentials.clone())
        .await
        .unwrap();
    let err = register_manifest(&orchestrator, &credentials, &manifest, |_| None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NOTES_TOKEN"), "{err}");
}
