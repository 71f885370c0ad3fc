use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;

use bytes::Bytes;

use crate::node::authz::Operation;
use crate::node::broker::EventType;
use crate::node::filemanager::FileManagerError;
use crate::node::storage::{Filter, MetadataFields, MetadataStorage, StorageError};

use super::mock;

fn fields(name: &str) -> MetadataFields {
    MetadataFields {
        name: name.into(),
        notes: "left knee".into(),
        patient_id: "p-1".into(),
        file_type: "image".into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_requires_create_permission() -> Result<()> {
    let h = mock::file_manager();
    let r = h.manager.create_file_metadata("bob", fields("x.dcm")).await;
    assert!(matches!(r, Err(FileManagerError::Unauthorized { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn creator_gets_full_access_and_an_event() -> Result<()> {
    let h = mock::file_manager();
    let mut sub = h.manager.add_listener();

    let meta = h.manager.create_file_metadata("alice", fields("x.dcm")).await?;
    assert_eq!(h.manager.get_file_metadata("alice", &meta.id).await?, meta);

    let change = sub.recv().await.unwrap();
    assert_eq!(change.event_type, EventType::Available);
    assert_eq!(change.file_ref, meta.id);
    assert_eq!(change.user, "alice");

    let perms = h.authz.mask("alice", &meta.id);
    assert!(Operation::Read.is_set(perms));
    assert!(Operation::Write.is_set(perms));
    assert!(Operation::Admin.is_set(perms));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_grant_rolls_back_the_record() -> Result<()> {
    let h = mock::file_manager();
    h.authz.fail_grants.store(true, Ordering::SeqCst);

    let r = h.manager.create_file_metadata("alice", fields("x.dcm")).await;
    assert!(matches!(r, Err(FileManagerError::Authz { .. })));

    // The record was turned into a tombstone.
    let records = h.metadata.get_many(&Filter::default())?;
    assert_eq!(records.len(), 1);
    assert!(records[0].deleted);
    assert!(h.manager.list_file_metadata("alice", None).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn contents_round_trip_updates_metadata() -> Result<()> {
    let h = mock::file_manager();
    let meta = h.manager.create_file_metadata("alice", fields("x.dcm")).await?;

    let updated = h
        .manager
        .update_file_contents("alice", &meta.id, Bytes::from_static(b"DICM"))
        .await?;
    assert_eq!(updated.size_bytes, 4);
    assert!(!updated.content_id.is_empty());
    assert!(updated.last_updated_ns > meta.last_updated_ns);

    let data = h.manager.get_file_contents("alice", &meta.id).await?;
    assert_eq!(data, Bytes::from_static(b"DICM"));

    // Files with contents cannot be removed.
    let r = h.manager.delete_file_metadata("alice", &meta.id).await;
    assert!(matches!(
        r,
        Err(FileManagerError::Storage {
            source: StorageError::NotEmpty { .. }
        })
    ));

    let emptied = h.manager.delete_file_contents("alice", &meta.id).await?;
    assert_eq!(emptied.size_bytes, 0);

    let tombstone = h.manager.delete_file_metadata("alice", &meta.id).await?;
    assert!(tombstone.deleted);
    assert!(tombstone.last_updated_ns > emptied.last_updated_ns);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn update_keeps_contents_fields() -> Result<()> {
    let h = mock::file_manager();
    let meta = h.manager.create_file_metadata("alice", fields("x.dcm")).await?;
    h.manager
        .update_file_contents("alice", &meta.id, Bytes::from_static(b"abc"))
        .await?;

    let renamed = h
        .manager
        .update_file_metadata("alice", &meta.id, fields("renamed.dcm"))
        .await?;
    assert_eq!(renamed.name, "renamed.dcm");
    assert_eq!(renamed.size_bytes, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn grant_requires_admin_and_bumps_stamp() -> Result<()> {
    let h = mock::file_manager();
    let meta = h.manager.create_file_metadata("alice", fields("x.dcm")).await?;

    let r = h
        .manager
        .grant("bob", "bob", Operation::Read, &meta.id)
        .await;
    assert!(matches!(r, Err(FileManagerError::Unauthorized { .. })));

    let mut sub = h.manager.add_listener();
    h.manager
        .grant("alice", "bob", Operation::Read, &meta.id)
        .await?;

    let seen = h.manager.get_file_metadata("bob", &meta.id).await?;
    assert!(seen.last_updated_ns > meta.last_updated_ns);

    let change = sub.recv().await.unwrap();
    assert_eq!(change.user, "bob");
    assert_eq!(change.event_type, EventType::Available);

    // Bob only sees what he was granted.
    let listed = h.manager.list_file_metadata("bob", None).await?;
    assert_eq!(listed.len(), 1);
    assert!(h
        .manager
        .update_file_metadata("bob", &meta.id, fields("nope"))
        .await
        .is_err());

    h.manager
        .revoke("alice", "bob", Operation::Read, &meta.id)
        .await?;
    assert!(!h.manager.can_read("bob", &meta.id).await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn list_filters_by_stamp() -> Result<()> {
    let h = mock::file_manager();
    let a = h.manager.create_file_metadata("alice", fields("a")).await?;
    let b = h.manager.create_file_metadata("alice", fields("b")).await?;

    let after_a = h
        .manager
        .list_file_metadata("alice", Some(a.last_updated_ns))
        .await?;
    assert_eq!(after_a.len(), 1);
    assert_eq!(after_a[0].id, b.id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resumed_scans_see_every_commit() -> Result<()> {
    let manager = Arc::new(mock::file_manager().manager);

    let mut ids = Vec::new();
    for i in 0..8 {
        let meta = manager
            .create_file_metadata("alice", fields(&format!("{}.dcm", i)))
            .await?;
        ids.push(meta.id);
    }

    let writers: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for round in 0..25 {
                    manager
                        .update_file_metadata("alice", &id, fields(&format!("r{}", round)))
                        .await?;
                }
                Ok::<_, FileManagerError>(())
            })
        })
        .collect();

    // Each pass resumes after the highest stamp seen so far, like a one-shot sync does.
    let mut checkpoint = 0;
    let mut seen: HashMap<String, i64> = HashMap::new();
    let mut scan = |records: Vec<protocol::files::FileMetadata>| {
        for meta in records {
            checkpoint = checkpoint.max(meta.last_updated_ns);
            seen.insert(meta.id, meta.last_updated_ns);
        }
        checkpoint
    };

    let mut from = 0;
    while writers.iter().any(|w| !w.is_finished()) {
        from = scan(manager.list_file_metadata("alice", Some(from)).await?);
        tokio::task::yield_now().await;
    }
    for writer in writers {
        writer.await??;
    }
    scan(manager.list_file_metadata("alice", Some(from)).await?);

    for meta in manager.list_file_metadata("alice", None).await? {
        assert_eq!(
            seen.get(&meta.id),
            Some(&meta.last_updated_ns),
            "missed the last write to {}",
            meta.id
        );
    }
    Ok(())
}
