//! End-to-end archive scenarios: WAL push/fetch, retries, base backup
//! lifecycle, continuity checks.

mod common;

use std::sync::Arc;

use common::{data_dir, fast_config, scripted_control, segment_bytes, segment_name, TestArchive};
use tokio_util::sync::CancellationToken;
use walship_archive::store::{Fault, StoreOp};
use walship_archive::{
    ArchiveError, ArchiveConfig, ArtifactKind, Archiver, BackupCoordinator, BackupState,
    ObjectStore, SpoolMode, TransferScheduler, WalFetchOutcome, WalVerification, LATEST,
};

#[tokio::test]
async fn test_wal_push_then_fetch_single_segment() {
    let t = TestArchive::new();
    let cancel = CancellationToken::new();
    let name = "000000010000000000000001";
    let contents = segment_bytes(1, 64 * 1024);
    let src = t.write_wal(name, &contents);

    let artifact = t.archiver.wal_push(&src, &cancel).await.unwrap();
    assert!(artifact.key.as_str().ends_with("wal_005/000000010000000000000001.lz4"));

    let dest = t.path("restored");
    let outcome = t.archiver.wal_fetch(name, &dest, &cancel).await.unwrap();
    assert_eq!(
        outcome,
        WalFetchOutcome::Restored {
            bytes: contents.len() as u64
        }
    );
    assert_eq!(std::fs::read(&dest).unwrap(), contents);

    let ctx = t.archiver.context();
    let listed = t.store.list(&ctx.wal_prefix()).await.unwrap();
    let wal: Vec<_> = listed
        .iter()
        .filter_map(|o| ctx.parse_key(&o.key))
        .filter(|(kind, _)| *kind == ArtifactKind::Segment)
        .collect();
    assert_eq!(wal, vec![(ArtifactKind::Segment, name.to_string())]);
}

#[tokio::test]
async fn test_two_transient_failures_then_success() {
    let t = TestArchive::new();
    let name = segment_name(7);
    let src = t.write_wal(&name, &segment_bytes(7, 4096));
    let key = t.archiver.context().wal_key(&name.parse().unwrap());
    t.store.inject(StoreOp::Put, key.as_str(), Fault::Transient, 2);

    t.archiver
        .wal_push(&src, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(t.store.put_attempts(key.as_str()), 3);
    assert!(t.store.raw(key.as_str()).is_some());
}

#[tokio::test]
async fn test_retry_exhaustion_leaves_no_artifact() {
    let t = TestArchive::new();
    let name = segment_name(8);
    let src = t.write_wal(&name, &segment_bytes(8, 4096));
    t.store.inject(StoreOp::Put, "", Fault::Transient, 100);

    let err = t
        .archiver
        .wal_push(&src, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(t.store.object_count(), 0);
}

#[tokio::test]
async fn test_fetch_of_never_pushed_key() {
    let t = TestArchive::new();
    let cancel = CancellationToken::new();
    let key = t
        .archiver
        .context()
        .wal_key(&"000000010000000000000042".parse().unwrap());

    let err = t.archiver.engine().fetch(&key, &cancel).await.unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound { .. }));
    assert_eq!(err.exit_code(), 1);

    let outcome = t
        .archiver
        .wal_fetch("000000010000000000000042", &t.path("x"), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, WalFetchOutcome::NotArchived);
    assert!(!t.path("x").exists());
}

#[tokio::test]
async fn test_concurrent_pushes_and_fetches_are_independent() {
    let t = Arc::new(TestArchive::new());
    let mut handles = Vec::new();
    for seg in 1..=12u32 {
        let t = Arc::clone(&t);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let name = segment_name(seg);
            let contents = segment_bytes(seg, 20_000 + seg as usize * 100);
            let src = t.write_wal(&name, &contents);
            t.archiver.wal_push(&src, &cancel).await.unwrap();
            let dest = t.path(&format!("restore-{}", seg));
            t.archiver.wal_fetch(&name, &dest, &cancel).await.unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), contents);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(t.store.object_count(), 12);
}

#[tokio::test]
async fn test_backup_with_failing_file_is_aborted_without_manifest() {
    let t = TestArchive::new();
    let src = t.path("pgdata");
    data_dir(&src, 5);
    t.store
        .inject(StoreOp::Put, "files/base/1/3.lz4", Fault::Permanent, 1);
    let control = scripted_control();

    let coordinator = BackupCoordinator::new(
        Arc::clone(t.archiver.engine()),
        t.archiver.context().clone(),
        control.clone(),
        TransferScheduler::new(2),
    );
    let err = coordinator
        .backup_push(&src, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(coordinator.state(), BackupState::Aborted);
    assert_eq!(control.calls(), vec!["start_backup", "stop_backup"]);
    let manifest_key = t
        .archiver
        .context()
        .manifest_key("base_000000010000000000000002_00000028")
        .unwrap();
    assert!(t.store.raw(manifest_key.as_str()).is_none());
    let listed = t
        .archiver
        .backup_list(None, false, &CancellationToken::new())
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_backup_roundtrip_through_local_store() {
    let store_dir = tempfile::tempdir().unwrap();
    let spool_dir = tempfile::tempdir().unwrap();
    let config = ArchiveConfig {
        spool: SpoolMode::DiskIn {
            dir: spool_dir.path().to_path_buf(),
        },
        ..fast_config(&format!("file://{}/cluster-a", store_dir.path().display()))
    };
    let archiver = Archiver::from_config(config).unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let src = scratch.path().join("pgdata");
    data_dir(&src, 4);
    let cancel = CancellationToken::new();

    let manifest = archiver
        .backup_push(&src, scripted_control(), &cancel)
        .await
        .unwrap();
    assert_eq!(manifest.label, "base_000000010000000000000002_00000028");
    assert_eq!(manifest.file_count(), 6);
    assert!(manifest.entries.iter().all(|e| e.path != "postmaster.pid"));
    assert!(manifest
        .entries
        .iter()
        .all(|e| !e.path.starts_with("pg_xlog/")));
    assert_eq!(archiver.engine().spool().live_entries(), 0);
    assert_eq!(std::fs::read_dir(spool_dir.path()).unwrap().count(), 0);

    let dest = scratch.path().join("restored");
    let restored = archiver.backup_fetch(LATEST, &dest, &cancel).await.unwrap();
    assert_eq!(restored.label, manifest.label);
    for i in 1..=4u32 {
        assert_eq!(
            std::fs::read(dest.join(format!("base/1/{}", i))).unwrap(),
            segment_bytes(i, 10_000 * i as usize)
        );
    }
    assert_eq!(std::fs::read(dest.join("PG_VERSION")).unwrap(), b"9.6\n");
    assert!(dest.join("pg_xlog").is_dir());
    assert!(!dest.join("pg_xlog/000000010000000000000002").exists());
    assert!(!dest.join("postmaster.pid").exists());

    let listed = archiver.backup_list(None, true, &cancel).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].stop, Some(manifest.stop));
}

#[tokio::test]
async fn test_gap_detection() {
    let t = TestArchive::new();
    let cancel = CancellationToken::new();
    for seg in [1u32, 2, 4] {
        let src = t.write_wal(&segment_name(seg), &segment_bytes(seg, 512));
        t.archiver.wal_push(&src, &cancel).await.unwrap();
    }

    let result = t
        .archiver
        .wal_verify(
            Some((
                segment_name(1).parse().unwrap(),
                segment_name(4).parse().unwrap(),
            )),
            &cancel,
        )
        .await
        .unwrap();
    match result {
        WalVerification::Range { gap: Some(gap), .. } => {
            assert_eq!(
                gap.last_contiguous.map(|s| s.to_string()),
                Some(segment_name(2))
            );
            assert_eq!(gap.expected_next.to_string(), segment_name(3));
        }
        other => panic!("expected a gap, got {:?}", other),
    }
    let outcome = t
        .archiver
        .wal_fetch(&segment_name(3), &t.path("hole"), &cancel)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WalFetchOutcome::Hole {
            next_available: segment_name(4).parse().unwrap()
        }
    );

    let src = t.write_wal(&segment_name(3), &segment_bytes(3, 512));
    t.archiver.wal_push(&src, &cancel).await.unwrap();
    let result = t
        .archiver
        .wal_verify(
            Some((
                segment_name(1).parse().unwrap(),
                segment_name(3).parse().unwrap(),
            )),
            &cancel,
        )
        .await
        .unwrap();
    assert!(result.is_continuous());
}

#[tokio::test]
async fn test_cancelled_push_cleans_up() {
    let t = TestArchive::new();
    let src = t.write_wal(&segment_name(9), &segment_bytes(9, 4096));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = t.archiver.wal_push(&src, &cancel).await.unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(t.archiver.engine().spool().live_entries(), 0);
    assert_eq!(t.store.object_count(), 0);
}

#[tokio::test]
async fn test_corrupted_segment_is_reported_not_restored() {
    let t = TestArchive::new();
    let cancel = CancellationToken::new();
    let name = segment_name(5);
    let src = t.write_wal(&name, &segment_bytes(5, 32 * 1024));
    let artifact = t.archiver.wal_push(&src, &cancel).await.unwrap();
    assert!(t.store.corrupt(artifact.key.as_str()));

    let dest = t.path("corrupt-restore");
    let err = t.archiver.wal_fetch(&name, &dest, &cancel).await.unwrap_err();
    assert!(matches!(err, ArchiveError::CorruptArtifact { .. }));
    assert_eq!(err.exit_code(), 3);
    assert!(!dest.exists());
}
