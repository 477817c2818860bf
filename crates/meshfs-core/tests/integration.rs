//! End-to-end coordinator scenarios: writer races, dual-mode ordering,
//! listing union, and the distributed format protocol.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{p, start_fs, start_fs_with_delay};

use meshfs_core::cluster::{
    DeleteCompleted, DiscoveryService, Envelope, EvictionPolicy, LocalCompute, LocalDiscovery,
    LocalMessaging, NodeId, TopologyEvent,
};
use meshfs_core::data::MemoryDataManager;
use meshfs_core::events::RecordingEventBus;
use meshfs_core::meta::{MemoryMetaManager, MetadataManager};
use meshfs_core::secondary::{MemorySecondaryFs, SecondaryFileSystem};
use meshfs_core::{Collaborators, MeshFs, MeshFsConfig, MeshFsError, MeshPath, Mode};
use std::sync::Arc;

#[tokio::test]
async fn overwrite_race_leaves_single_entry() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let fs1 = t.fs.clone();
    let fs2 = t.fs.clone();

    let t1 = tokio::spawn(async move {
        let mut w = fs1.create(&p("/a"), true).await?;
        w.write(b"from-first-writer").await?;
        w.close().await?;
        Ok::<_, MeshFsError>(())
    });

    let t2 = tokio::spawn(async move {
        let mut w = fs2.create(&p("/a"), true).await?;
        w.write(b"from-second-writer").await?;
        w.close().await?;
        Ok::<_, MeshFsError>(())
    });

    let r1 = t1.await.unwrap();
    let r2 = t2.await.unwrap();

    // A racer that observes the winner's live write lock loses; at least
    // one writer must complete.
    assert!(r1.is_ok() || r2.is_ok());

    let listing = t.meta.directory_listing(meshfs_core::FileId::ROOT).await.unwrap();
    let entries: Vec<_> = listing.keys().filter(|n| n.as_str() == "a").collect();
    assert_eq!(entries.len(), 1, "metadata must hold exactly one entry for /a");

    let mut r = t.fs.open(&p("/a")).await.unwrap();
    let content = r.read_to_end().await.unwrap();
    r.close().await.unwrap();

    assert!(
        content == b"from-first-writer" || content == b"from-second-writer",
        "file must contain one complete writer's bytes"
    );
}

#[tokio::test]
async fn dual_async_delete_waits_for_pending_batch() {
    let t = start_fs_with_delay(
        MeshFsConfig::default(),
        true,
        Duration::from_millis(25),
    )
    .await;

    let path = p("/ignite/async/x");

    let mut w = t.fs.create(&path, false).await.unwrap();
    w.write(b"payload that must land before the delete").await.unwrap();
    w.close().await.unwrap(); // DUAL_ASYNC: returns with the batch in flight.

    // Give the worker a beat to pick up the batch; the 25ms write delay
    // keeps it in flight well past this point.
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(t.fs.delete(&path, false).await.unwrap());

    let log = t.secondary.as_ref().unwrap().log();
    let close_idx = log.iter().position(|e| e == "close:/ignite/async/x");
    let delete_idx = log.iter().position(|e| e == "delete:/ignite/async/x");

    assert!(
        close_idx.is_some() && delete_idx.is_some() && close_idx < delete_idx,
        "secondary must observe the full write before the delete, got {log:?}"
    );

    assert!(!t
        .secondary
        .as_ref()
        .unwrap()
        .exists(&path)
        .await
        .unwrap());
}

#[tokio::test]
async fn dual_create_reaches_both_stores() {
    let t = start_fs(MeshFsConfig::default(), true).await;
    let path = p("/ignite/sync/data.bin");

    let mut w = t.fs.create(&path, false).await.unwrap();
    w.write(b"dual payload").await.unwrap();
    w.close().await.unwrap(); // DUAL_SYNC: batch flushed before close returns.

    assert_eq!(
        t.secondary.as_ref().unwrap().inner().file_content(&path),
        Some(b"dual payload".to_vec())
    );

    let mut r = t.fs.open(&path).await.unwrap();
    assert_eq!(r.read_to_end().await.unwrap(), b"dual payload");
    r.close().await.unwrap();
}

#[tokio::test]
async fn rename_across_eviction_boundary_is_rejected() {
    struct NoExclusions;

    impl EvictionPolicy for NoExclusions {
        fn exclude(&self, _path: &MeshPath) -> bool {
            false
        }
    }

    let cfg = MeshFsConfig {
        path_modes: vec![("/hot".to_string(), Mode::DualSync)],
        ..MeshFsConfig::default()
    };

    let events = Arc::new(RecordingEventBus::new());
    let meta = Arc::new(MemoryMetaManager::new());
    let discovery = Arc::new(LocalDiscovery::new(&cfg.name));
    let data = Arc::new(MemoryDataManager::new(1 << 16, 1 << 30, discovery.local_node()));
    let secondary = Arc::new(MemorySecondaryFs::new());

    let fs = MeshFs::start(
        cfg,
        Collaborators {
            meta,
            data,
            secondary: Some(secondary as Arc<dyn SecondaryFileSystem>),
            events,
            discovery,
            messaging: Arc::new(LocalMessaging::new()),
            compute: Arc::new(LocalCompute::new()),
            eviction: Some(Arc::new(NoExclusions)),
        },
    )
    .await
    .unwrap();

    let mut w = fs.create(&p("/hot/a"), false).await.unwrap();
    w.write(b"pinned").await.unwrap();
    w.close().await.unwrap();

    // Source is non-primary and not excluded; destination is PRIMARY and
    // therefore always excluded.
    let err = fs.rename(&p("/hot/a"), &p("/cold/a")).await.unwrap_err();
    assert!(matches!(err, MeshFsError::InvalidPath(_)));

    assert!(fs.exists(&p("/hot/a")).await.unwrap(), "tree must be unchanged");
    assert!(!fs.exists(&p("/cold/a")).await.unwrap());
}

#[tokio::test]
async fn listing_union_merges_both_stores() {
    let t = start_fs(MeshFsConfig::default(), true).await;
    let dir = p("/ignite/sync");

    // `m` goes through the coordinator and lands in both stores.
    let mut w = t.fs.create(&dir.child("m"), false).await.unwrap();
    w.write(b"m-content").await.unwrap();
    w.close().await.unwrap();

    // `n` exists only in the secondary.
    let sec = t.secondary.as_ref().unwrap();
    let mut w = sec.create(&dir.child("n"), false, None).await.unwrap();
    w.write(b"n-content").await.unwrap();
    w.close().await.unwrap();

    let mut names: Vec<String> = t
        .fs
        .list_paths(&dir)
        .await
        .unwrap()
        .iter()
        .map(|path| path.name().to_string())
        .collect();
    names.sort();

    assert_eq!(names, vec!["m".to_string(), "n".to_string()]);

    let files = t.fs.list_files(&dir).await.unwrap();
    assert_eq!(files.len(), 2);

    let n = files.iter().find(|f| f.path.name() == "n").unwrap();
    assert_eq!(n.length, 9);
}

#[tokio::test]
async fn format_completes_via_peer_message() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let mut w = t.fs.create(&p("/doomed"), false).await.unwrap();
    w.close().await.unwrap();

    let awaiter = t.fs.format_async().await.unwrap();
    assert_eq!(t.fs.pending_delete_count(), 1);

    let trash_id = *t
        .meta
        .pending_deletes()
        .await
        .unwrap()
        .iter()
        .next()
        .unwrap();

    // A peer with the same filesystem name reports the purge done.
    let peer = NodeId::random();
    t.discovery.add_node(peer, vec![t.fs.name().to_string()]);
    t.messaging.publish(
        &format!("meshfs-delete-{}", t.fs.name()),
        Envelope {
            sender: peer,
            message: DeleteCompleted { id: trash_id, error: None },
        },
    );

    tokio::time::timeout(Duration::from_secs(2), awaiter.wait())
        .await
        .expect("format future must resolve")
        .unwrap();

    assert_eq!(t.fs.pending_delete_count(), 0);
    assert!(!t.fs.exists(&p("/doomed")).await.unwrap());
}

#[tokio::test]
async fn format_messages_from_other_filesystems_are_ignored() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let mut w = t.fs.create(&p("/f"), false).await.unwrap();
    w.close().await.unwrap();

    let _awaiter = t.fs.format_async().await.unwrap();
    let trash_id = *t.meta.pending_deletes().await.unwrap().iter().next().unwrap();

    // Sender advertises a different filesystem name.
    let stranger = NodeId::random();
    t.discovery.add_node(stranger, vec!["other-fs".to_string()]);
    t.messaging.publish(
        &format!("meshfs-delete-{}", t.fs.name()),
        Envelope {
            sender: stranger,
            message: DeleteCompleted { id: trash_id, error: None },
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.fs.pending_delete_count(), 1, "foreign message must be ignored");
}

#[tokio::test]
async fn format_completes_when_purging_peer_leaves() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let mut w = t.fs.create(&p("/victim"), false).await.unwrap();
    w.close().await.unwrap();

    let awaiter = t.fs.format_async().await.unwrap();
    let trash_id = *t.meta.pending_deletes().await.unwrap().iter().next().unwrap();

    // The purge finished in metadata, but the peer died before its
    // completion message went out.
    t.meta.purge(trash_id);

    let peer = t.discovery.local_node();
    t.discovery.publish(TopologyEvent::NodeFailed(peer));

    tokio::time::timeout(Duration::from_secs(2), awaiter.wait())
        .await
        .expect("node-left sweep must resolve the future")
        .unwrap();

    assert_eq!(t.fs.pending_delete_count(), 0);
}

#[tokio::test]
async fn concurrent_formats_share_one_soft_delete() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let mut w = t.fs.create(&p("/x"), false).await.unwrap();
    w.close().await.unwrap();

    let a1 = t.fs.format_async().await.unwrap();
    let a2 = t.fs.format_async().await.unwrap();

    // The second call found the root already empty, so exactly one trash
    // entry is pending.
    let pending = t.meta.pending_deletes().await.unwrap();
    assert_eq!(pending.len(), 1);

    let trash_id = *pending.iter().next().unwrap();
    t.meta.purge(trash_id);
    t.discovery
        .publish(TopologyEvent::NodeLeft(t.discovery.local_node()));

    tokio::time::timeout(Duration::from_secs(2), async {
        a1.wait().await.unwrap();
        a2.wait().await.unwrap();
    })
    .await
    .expect("both format futures must resolve");
}

#[tokio::test]
async fn format_of_empty_filesystem_is_immediate() {
    let t = start_fs(MeshFsConfig::default(), false).await;
    t.fs.format().await.unwrap();
    assert_eq!(t.fs.pending_delete_count(), 0);
}

#[tokio::test]
async fn await_deletes_covers_soft_deleted_directories() {
    let t = start_fs(MeshFsConfig::default(), false).await;

    let mut w = t.fs.create(&p("/dir/f"), false).await.unwrap();
    w.close().await.unwrap();

    assert!(t.fs.delete(&p("/dir"), true).await.unwrap());

    let composite = t.fs.await_deletes_async().await.unwrap();
    let pending = t.meta.pending_deletes().await.unwrap();
    assert_eq!(pending.len(), 1);

    let trash_id = *pending.iter().next().unwrap();
    t.meta.purge(trash_id);
    t.discovery
        .publish(TopologyEvent::NodeLeft(t.discovery.local_node()));

    tokio::time::timeout(Duration::from_secs(2), composite.wait())
        .await
        .expect("composite delete future must resolve")
        .unwrap();
}

#[tokio::test]
async fn dual_info_synthesizes_from_secondary_without_insert() {
    let t = start_fs(MeshFsConfig::default(), true).await;
    let path = p("/ignite/sync/ghost");

    let sec = t.secondary.as_ref().unwrap();
    let mut w = sec.create(&path, false, None).await.unwrap();
    w.write(b"only-secondary").await.unwrap();
    w.close().await.unwrap();

    let file = t.fs.info(&path).await.unwrap().unwrap();
    assert!(file.is_file);
    assert_eq!(file.length, 14);

    // The info call must not have pulled the entry into the namespace.
    assert!(t.meta.file_id(&path).await.unwrap().is_none());

    // exists() consults both stores.
    assert!(t.fs.exists(&path).await.unwrap());
}

#[tokio::test]
async fn stop_cancels_writers_and_closes_secondary() {
    let t = start_fs_with_delay(
        MeshFsConfig::default(),
        true,
        Duration::from_millis(10),
    )
    .await;

    let path = p("/ignite/async/slow");
    let mut w = t.fs.create(&path, false).await.unwrap();
    w.write(b"0123456789abcdef").await.unwrap();
    w.close().await.unwrap();

    t.fs.stop().await;

    assert!(matches!(
        t.fs.exists(&path).await,
        Err(MeshFsError::IllegalState(_))
    ));
    assert!(t.secondary.as_ref().unwrap().inner().is_closed());
}

#[tokio::test]
async fn dual_mkdirs_and_delete_mirror_to_secondary() {
    let t = start_fs(MeshFsConfig::default(), true).await;
    let dir = p("/ignite/sync/tree/leaf");

    let mut props = HashMap::new();
    props.insert("permission".to_string(), "0750".to_string());

    t.fs.mkdirs_with(&dir, Some(props)).await.unwrap();

    let sec = t.secondary.as_ref().unwrap();
    assert!(sec.exists(&dir).await.unwrap());
    assert!(t.fs.exists(&dir).await.unwrap());

    assert!(t.fs.delete(&p("/ignite/sync/tree"), true).await.unwrap());
    assert!(!sec.exists(&dir).await.unwrap());
    assert!(!t.fs.exists(&dir).await.unwrap());
}

#[tokio::test]
async fn dual_append_orders_after_create_batch() {
    let t = start_fs_with_delay(
        MeshFsConfig::default(),
        true,
        Duration::from_millis(5),
    )
    .await;

    let path = p("/ignite/async/log");

    let mut w = t.fs.create(&path, false).await.unwrap();
    w.write(b"first;").await.unwrap();
    w.close().await.unwrap();

    // The append must await the create batch before touching metadata.
    let mut w = t.fs.append(&path, false).await.unwrap();
    w.write(b"second").await.unwrap();
    w.close().await.unwrap();

    // The append batch drains in the background.
    let sec = t.secondary.as_ref().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if sec.inner().file_content(&path) == Some(b"first;second".to_vec()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "append batch never reached the secondary: {:?}",
            sec.inner().file_content(&path)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
