use anyhow::Result;

use testing::fixtures::Federation;

const ORG: &str = "st-mary";

#[tokio::test(flavor = "multi_thread")]
async fn granted_files_reach_the_reader() -> Result<()> {
    let mut federation = Federation::new().await?;
    let org = federation.add_organization(ORG).await?;
    federation
        .add_file_server(&org, "fs-alpha", &["alice"])
        .await?;

    let alice = federation.add_user("alice").await?;
    let bob = federation.add_user("bob").await?;
    federation.link(&alice, ORG, "fs-alpha", "alice").await?;
    federation.link(&bob, ORG, "fs-alpha", "bob").await?;

    let file = federation
        .create_file("fs-alpha", "alice", "mri.dcm", b"slices")
        .await?;
    federation.wait_for_mapping(&alice, &file.id, |_| true).await?;
    assert!(federation
        .mappings(&bob, true)
        .await?
        .iter()
        .all(|m| m.file_ref != file.id));

    federation
        .grant("fs-alpha", "alice", "bob", "read", &file.id)
        .await?;
    let shared = federation.wait_for_mapping(&bob, &file.id, |_| true).await?;
    assert!(!shared.deleted);

    // Deletion reaches everyone who could read the file.
    federation.delete_file("fs-alpha", "alice", &file.id).await?;
    federation
        .wait_for_mapping(&alice, &file.id, |m| m.deleted)
        .await?;
    federation
        .wait_for_mapping(&bob, &file.id, |m| m.deleted)
        .await?;

    federation.stop_all().await
}

#[tokio::test(flavor = "multi_thread")]
async fn only_creators_can_create() -> Result<()> {
    let mut federation = Federation::new().await?;
    let org = federation.add_organization(ORG).await?;
    federation
        .add_file_server(&org, "fs-alpha", &["alice"])
        .await?;

    assert!(federation
        .create_file("fs-alpha", "mallory", "x.txt", b"x")
        .await
        .is_err());
    federation
        .create_file("fs-alpha", "alice", "x.txt", b"x")
        .await?;

    federation.stop_all().await
}
