use anyhow::{ensure, Result};

use protocol::index::mappings::{NewMappingRequest, UpdateMappingRequest};

use snafu::Snafu;

use crate::node::model::{new_id, Mapping, MappingEdit, MappingQuery, ServerUpdate};
use crate::node::store::iface::{DynFileServerStore, DynMappingStore};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MappingError {
    #[snafu(display("{} cannot be empty", field))]
    EmptyField { field: &'static str },
}

/// A user's virtual namespace over the files of every linked server.
pub struct MappingService {
    mappings: DynMappingStore,
    servers: DynFileServerStore,
}

impl MappingService {
    pub fn new(mappings: DynMappingStore, servers: DynFileServerStore) -> Self {
        Self { mappings, servers }
    }

    pub fn list(&self, user_id: &str, query: &MappingQuery) -> Result<Vec<Mapping>> {
        Ok(self.mappings.list(user_id, query)?)
    }

    pub fn get(&self, user_id: &str, id: &str) -> Result<Mapping> {
        Ok(self.mappings.get(user_id, id)?)
    }

    #[tracing::instrument(skip(self, request), fields(server = %request.server_id, file_ref = %request.file_ref))]
    pub fn add(&self, user_id: &str, request: NewMappingRequest) -> Result<Mapping> {
        ensure!(
            !request.path.is_empty(),
            MappingError::EmptyField { field: "path" }
        );
        ensure!(
            !request.file_ref.is_empty(),
            MappingError::EmptyField { field: "fileRef" }
        );

        // Unknown servers surface as not found.
        self.servers.get(&request.server_id)?;

        let mapping = Mapping {
            id: new_id(),
            user_id: user_id.to_string(),
            server_id: request.server_id,
            file_ref: request.file_ref,
            path: request.path,
            patient_id: request.patient_id,
            size_bytes: 0,
            deleted: false,
            updated_ns: 0,
        };
        self.mappings.add(&mapping)?;
        Ok(mapping)
    }

    #[tracing::instrument(skip(self, request))]
    pub fn update(&self, user_id: &str, id: &str, request: UpdateMappingRequest) -> Result<Mapping> {
        if let Some(path) = &request.path {
            ensure!(!path.is_empty(), MappingError::EmptyField { field: "path" });
        }
        let edit = MappingEdit {
            path: request.path,
            patient_id: request
                .patient_id
                .map(|p| Some(p).filter(|p| !p.is_empty())),
        };

        Ok(self.mappings.edit(user_id, id, &edit)?)
    }

    pub fn remove(&self, user_id: &str, id: &str) -> Result<()> {
        Ok(self.mappings.remove(user_id, id)?)
    }

    pub fn apply_updates(
        &self,
        user_id: &str,
        server_id: &str,
        updates: &[ServerUpdate],
    ) -> Result<()> {
        Ok(self
            .mappings
            .handle_server_updates(user_id, server_id, updates)?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.mappings.flush().await
    }
}
