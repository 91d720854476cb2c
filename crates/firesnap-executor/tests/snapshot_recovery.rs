//! Registry recovery after a crash: only complete snapshot directories
//! survive, and recovering twice reaches the same state.

use firesnap_common::Error;
use firesnap_executor::snapshots::SnapshotManager;

const GOOD_INFO: &[u8] = br#"{"image":"docker.io/library/helloworld:1","mem_size_mib":256,"vcpu_count":1}"#;

fn seed_dir(base: &std::path::Path, revision: &str, files: &[(&str, &[u8])]) {
    let dir = base.join(revision);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

#[tokio::test]
async fn recovery_keeps_complete_directories_and_removes_the_rest() {
    let scratch = tempfile::tempdir().unwrap();
    let base = scratch.path();

    seed_dir(
        base,
        "good",
        &[
            ("memfile", b"memory"),
            ("snapfile", b"machine state"),
            ("patchfile", b"batch"),
            ("infofile", GOOD_INFO),
        ],
    );
    seed_dir(
        base,
        "partial",
        &[("memfile", b"memory"), ("snapfile", b"machine state")],
    );
    seed_dir(
        base,
        "corrupt",
        &[
            ("memfile", b"memory"),
            ("snapfile", b"machine state"),
            ("patchfile", b"batch"),
            ("infofile", b"not json at all"),
        ],
    );
    std::fs::write(base.join("stray.tmp"), b"leftover").unwrap();

    let manager = SnapshotManager::new(base, 1024);
    manager.recover().await.unwrap();

    let good = manager.lookup("good").await.unwrap();
    assert_eq!(
        good.read_info().unwrap().image,
        "docker.io/library/helloworld:1"
    );

    assert!(matches!(
        manager.lookup("partial").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(
        manager.lookup("corrupt").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(!base.join("partial").exists());
    assert!(!base.join("corrupt").exists());
    assert!(!base.join("stray.tmp").exists());
    assert!(base.join("good").exists());
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let scratch = tempfile::tempdir().unwrap();
    let base = scratch.path();
    seed_dir(
        base,
        "good",
        &[
            ("memfile", b"memory"),
            ("snapfile", b"machine state"),
            ("patchfile", b"batch"),
            ("infofile", GOOD_INFO),
        ],
    );

    let manager = SnapshotManager::new(base, 1024);
    manager.recover().await.unwrap();
    let usage = manager.usage_mib().await;

    manager.recover().await.unwrap();
    assert_eq!(manager.usage_mib().await, usage);
    manager.lookup("good").await.unwrap();
}

#[tokio::test]
async fn recovered_revisions_reject_re_registration() {
    let scratch = tempfile::tempdir().unwrap();
    let base = scratch.path();
    seed_dir(
        base,
        "good",
        &[
            ("memfile", b"memory"),
            ("snapfile", b"machine state"),
            ("patchfile", b"batch"),
            ("infofile", GOOD_INFO),
        ],
    );

    let manager = SnapshotManager::new(base, 1024);
    manager.recover().await.unwrap();

    let err = manager.register("good", 16).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}
