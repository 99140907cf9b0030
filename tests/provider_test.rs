//! Tests for the disk artifact provider — atomic materialization.

use munin::provider::DiskProvider;
use munin::{ModelKey, ModelProvider, MuninError};

fn seed_artifact(base: &std::path::Path, name: &str, version: &str) {
    let dir = base.join(name).join(version);
    std::fs::create_dir_all(dir.join("variables")).unwrap();
    std::fs::write(dir.join("saved_model.pb"), b"graph-bytes").unwrap();
    std::fs::write(dir.join("variables/variables.data"), b"weights").unwrap();
}

#[tokio::test]
async fn fetch_copies_the_version_tree() {
    let repo = tempfile::tempdir().unwrap();
    seed_artifact(repo.path(), "resnet", "3");
    let local = tempfile::tempdir().unwrap();
    let dest = local.path().join("resnet").join("3");
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();

    let provider = DiskProvider::new(repo.path().to_path_buf());
    let bytes = provider
        .fetch(&ModelKey::new("resnet", "3"), &dest)
        .await
        .unwrap();

    assert_eq!(bytes, ("graph-bytes".len() + "weights".len()) as u64);
    assert!(dest.join("saved_model.pb").is_file());
    assert!(dest.join("variables/variables.data").is_file());
}

#[tokio::test]
async fn missing_artifact_fails_without_leaving_files() {
    let repo = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let dest = local.path().join("ghost").join("1");
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();

    let provider = DiskProvider::new(repo.path().to_path_buf());
    let err = provider
        .fetch(&ModelKey::new("ghost", "1"), &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, MuninError::FetchFailed { .. }), "got {err}");
    assert!(!dest.exists(), "failed fetch must not materialize anything");
}

#[tokio::test]
async fn refetch_replaces_stale_content() {
    let repo = tempfile::tempdir().unwrap();
    seed_artifact(repo.path(), "resnet", "3");
    let local = tempfile::tempdir().unwrap();
    let dest = local.path().join("resnet").join("3");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("leftover"), b"stale").unwrap();

    let provider = DiskProvider::new(repo.path().to_path_buf());
    provider
        .fetch(&ModelKey::new("resnet", "3"), &dest)
        .await
        .unwrap();

    assert!(!dest.join("leftover").exists(), "stale tree must be replaced");
    assert!(dest.join("saved_model.pb").is_file());
}

#[tokio::test]
async fn fetch_leaves_no_staging_sibling() {
    let repo = tempfile::tempdir().unwrap();
    seed_artifact(repo.path(), "resnet", "3");
    let local = tempfile::tempdir().unwrap();
    let parent = local.path().join("resnet");
    std::fs::create_dir_all(&parent).unwrap();

    let provider = DiskProvider::new(repo.path().to_path_buf());
    provider
        .fetch(&ModelKey::new("resnet", "3"), &parent.join("3"))
        .await
        .unwrap();

    let names: Vec<String> = std::fs::read_dir(&parent)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["3".to_string()]);
}
