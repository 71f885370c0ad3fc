use std::sync::Arc;

use anyhow::Result;

use protocol::fileserver::ServerInfo;
use protocol::index::mappings::{NewMappingRequest, UpdateMappingRequest};

use crate::node::model::{ChangeKind, MappingQuery, ServerUpdate};
use crate::node::{IndexNode, RepositoryError};

use super::mock;

fn node_with_server() -> Result<(IndexNode, String)> {
    let node = mock::node(Arc::default())?;
    node.registrar().add_organization("st-mary")?;
    let (_, server) = node.registrar().register_server(
        "fs-alpha",
        &ServerInfo {
            org_name: "st-mary".into(),
            name: "fs-alpha".into(),
            auth_url: "https://fs-alpha/authorize".into(),
            token_url: "https://fs-alpha/token".into(),
            fetch_url: "https://fs-alpha/files".into(),
            control_endpoint: "fs-alpha:4001".into(),
        },
    )?;
    Ok((node, server.id))
}

fn update(file_ref: &str, kind: ChangeKind, checkpoint: i64) -> ServerUpdate {
    ServerUpdate {
        file_ref: file_ref.into(),
        kind,
        checkpoint,
        size_bytes: 42,
    }
}

#[test]
fn renamed_paths_survive_server_updates() -> Result<()> {
    let (node, server_id) = node_with_server()?;
    let mappings = node.mappings();

    mappings.apply_updates("u1", &server_id, &[update("f1", ChangeKind::Add, 100)])?;
    let listed = mappings.list("u1", &MappingQuery::default())?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, format!("unassigned/{}/f1", server_id));

    let renamed = mappings.update(
        "u1",
        &listed[0].id,
        UpdateMappingRequest {
            path: Some("knee/mri.dcm".into()),
            patient_id: Some("p-7".into()),
        },
    )?;
    assert_eq!(renamed.path, "knee/mri.dcm");

    mappings.apply_updates("u1", &server_id, &[update("f1", ChangeKind::Update, 200)])?;
    let m = mappings.get("u1", &renamed.id)?;
    assert_eq!(m.path, "knee/mri.dcm");
    assert_eq!(m.patient_id.as_deref(), Some("p-7"));
    assert_eq!(m.updated_ns, 200);
    Ok(())
}

#[test]
fn manual_mappings() -> Result<()> {
    let (node, server_id) = node_with_server()?;
    let mappings = node.mappings();

    let added = mappings.add(
        "u1",
        NewMappingRequest {
            server_id: server_id.clone(),
            file_ref: "f9".into(),
            path: "notes/visit.txt".into(),
            patient_id: None,
        },
    )?;

    let by_path = MappingQuery {
        path_prefix: Some("notes/".into()),
        ..Default::default()
    };
    assert_eq!(mappings.list("u1", &by_path)?, vec![added.clone()]);
    assert!(mappings.list("u2", &by_path)?.is_empty());

    let unknown_server = mappings.add(
        "u1",
        NewMappingRequest {
            server_id: "nope".into(),
            file_ref: "f1".into(),
            path: "x".into(),
            patient_id: None,
        },
    );
    assert!(unknown_server.is_err());

    mappings.remove("u1", &added.id)?;
    let e = mappings.get("u1", &added.id).unwrap_err();
    assert!(e
        .downcast_ref::<RepositoryError>()
        .map(|e| e.is_not_found())
        .unwrap_or(false));
    Ok(())
}
