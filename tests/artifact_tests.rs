use agentflow::agentflow::artifact::{
    ArtifactKey, ArtifactService, FileArtifactService, InMemoryArtifactService,
};
use agentflow::agentflow::content::Blob;
use agentflow::Part;
use std::sync::Arc;

fn key(filename: &str) -> ArtifactKey {
    ArtifactKey::new("app", "alice", "s1", filename)
}

fn blob(bytes: &[u8]) -> Part {
    Part::InlineBlob(Blob {
        mime_type: "application/octet-stream".to_string(),
        data: bytes.to_vec(),
    })
}

async fn round_trip(store: &dyn ArtifactService) {
    let k = key("report.bin");

    let v0 = store.save_artifact(&k, blob(b"first")).await.unwrap();
    let v1 = store.save_artifact(&k, blob(b"second")).await.unwrap();
    assert_eq!((v0, v1), (0, 1));

    // Exact version loads return exactly what was stored.
    let loaded = store.load_artifact(&k, Some(0)).await.unwrap().unwrap();
    assert_eq!(loaded, blob(b"first"));

    // No version means latest.
    let latest = store.load_artifact(&k, None).await.unwrap().unwrap();
    assert_eq!(latest, blob(b"second"));

    assert_eq!(store.list_versions(&k).await.unwrap(), vec![0, 1]);

    store.delete_artifact(&k).await.unwrap();
    assert!(store.load_artifact(&k, None).await.unwrap().is_none());
    assert!(store.list_versions(&k).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_in_memory_round_trip() {
    round_trip(&InMemoryArtifactService::new()).await;
}

#[tokio::test]
async fn test_file_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    round_trip(&FileArtifactService::new(dir.path())).await;
}

#[tokio::test]
async fn test_file_backend_uses_object_store_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileArtifactService::new(dir.path());

    store.save_artifact(&key("notes.txt"), Part::text("n")).await.unwrap();
    store
        .save_artifact(&key("user:prefs.json"), Part::text("p"))
        .await
        .unwrap();

    assert!(dir.path().join("app/alice/s1/notes.txt/0").is_file());
    assert!(dir.path().join("app/alice/user/user:prefs.json/0").is_file());

    let names = store.list_artifact_keys("app", "alice", "s1").await.unwrap();
    assert_eq!(names, vec!["notes.txt", "user:prefs.json"]);
}

#[tokio::test]
async fn test_user_namespaced_artifacts_span_sessions() {
    let store = InMemoryArtifactService::new();
    store
        .save_artifact(
            &ArtifactKey::new("app", "alice", "s1", "user:prefs.json"),
            Part::text("dark mode"),
        )
        .await
        .unwrap();

    // Visible from a different session of the same user.
    let from_other_session = store
        .load_artifact(
            &ArtifactKey::new("app", "alice", "s2", "user:prefs.json"),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from_other_session.as_text(), Some("dark mode"));
}

async fn concurrent_saves(store: Arc<dyn ArtifactService>) {
    let k = key("contended.bin");
    let mut handles = Vec::new();
    for i in 0..10u8 {
        let store = store.clone();
        let k = k.clone();
        handles.push(tokio::spawn(async move {
            store.save_artifact(&k, blob(&[i])).await.unwrap()
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();
    // No duplicates, no gaps.
    assert_eq!(versions, (0..10).collect::<Vec<u64>>());
    assert_eq!(
        store.list_versions(&k).await.unwrap(),
        (0..10).collect::<Vec<u64>>()
    );
}

#[tokio::test]
async fn test_concurrent_saves_in_memory() {
    concurrent_saves(Arc::new(InMemoryArtifactService::new())).await;
}

#[tokio::test]
async fn test_concurrent_saves_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    concurrent_saves(Arc::new(FileArtifactService::new(dir.path()))).await;
}
