//! The default plugin: contents on disk, metadata and permissions in sled.
mod authz;
mod files;
mod metadata;

use std::any::Any;
use std::sync::Arc;

use snafu::ResultExt;

use super::{required_arg, v1, InitSnafu, PluginError, PluginModule};

pub use authz::SledAuthorization;
pub use files::DiskFileStorage;
pub use metadata::SledMetadataStorage;

pub const BASIC_PLUGIN_NAME: &str = "basic";

const FILE_PATH_ARG: &str = "filePath";
const DB_PATH_ARG: &str = "authDBPath";

pub const BASIC_PLUGIN: PluginModule = PluginModule {
    name: BASIC_PLUGIN_NAME,
    api_version,
    create,
};

fn api_version() -> u32 {
    v1::API_VERSION
}

fn create(args: &v1::Args) -> Result<Box<dyn Any + Send>, PluginError> {
    let file_path = required_arg(args, FILE_PATH_ARG)?;
    let db_path = required_arg(args, DB_PATH_ARG)?;

    let db = sled::open(db_path).map_err(|e| PluginError::BadArgument {
        arg: DB_PATH_ARG.into(),
        reason: e.to_string(),
    })?;

    let plugin = v1::Plugin {
        files: Arc::new(DiskFileStorage::new(file_path).context(InitSnafu)?),
        metadata: Arc::new(SledMetadataStorage::new(&db).context(InitSnafu)?),
        authorization: Arc::new(SledAuthorization::new(&db).map_err(|e| {
            PluginError::BadArgument {
                arg: DB_PATH_ARG.into(),
                reason: e.to_string(),
            }
        })?),
    };

    Ok(Box::new(plugin))
}
