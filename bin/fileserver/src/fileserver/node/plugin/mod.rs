//! Compile-time registry of storage plugins.
//!
//! Each module exposes an API version and a constructor returning an opaque plugin object.
//! The loader dispatches on the version, downcasts the object to that version's contract,
//! and wraps it in the matching adapter.
mod adapter;
mod basic;
mod memory;
pub mod v1;

use std::any::Any;

use snafu::Snafu;

use crate::config::PluginSetting;
use crate::node::authz::DynAuthorization;
use crate::node::storage::{DynFileStorage, DynMetadataStorage, StorageError};

pub use basic::{BASIC_PLUGIN, BASIC_PLUGIN_NAME};
pub use memory::{MEMORY_PLUGIN, MEMORY_PLUGIN_NAME};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PluginError {
    #[snafu(display("unknown plugin '{}'", name))]
    UnknownPlugin { name: String },

    #[snafu(display("plugin '{}' implements unknown api version {}", name, version))]
    PluginVersionUnknown { name: String, version: u32 },

    #[snafu(display(
        "plugin '{}' implements api version {} but version {} was requested",
        name,
        actual,
        expected
    ))]
    VersionMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[snafu(display("plugin '{}' did not produce a v{} plugin", name, version))]
    BadSymbol { name: String, version: u32 },

    #[snafu(display("bad plugin argument '{}': {}", arg, reason))]
    BadArgument { arg: String, reason: String },

    #[snafu(display("plugin initialization failed: {}", source))]
    Init { source: StorageError },
}

/// The two entrypoints every plugin exposes.
pub struct PluginModule {
    pub name: &'static str,
    pub api_version: fn() -> u32,
    pub create: fn(&v1::Args) -> Result<Box<dyn Any + Send>, PluginError>,
}

pub const BUILTIN_PLUGINS: &[PluginModule] = &[BASIC_PLUGIN, MEMORY_PLUGIN];

/// A plugin, seen through the host's contracts.
pub struct LoadedPlugin {
    pub files: DynFileStorage,
    pub metadata: DynMetadataStorage,
    pub authorization: DynAuthorization,
}

pub(crate) fn required_arg<'a>(args: &'a v1::Args, name: &str) -> Result<&'a str, PluginError> {
    args.get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PluginError::BadArgument {
            arg: name.into(),
            reason: "missing".into(),
        })
}

#[tracing::instrument(skip(modules, args))]
pub fn load_from(
    modules: &[PluginModule],
    name: &str,
    expected_version: Option<u32>,
    args: &v1::Args,
) -> Result<LoadedPlugin, PluginError> {
    let module = modules
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| PluginError::UnknownPlugin { name: name.into() })?;

    let version = (module.api_version)();
    if let Some(expected) = expected_version {
        snafu::ensure!(
            expected == version,
            VersionMismatchSnafu {
                name,
                expected,
                actual: version
            }
        );
    }

    match version {
        v1::API_VERSION => {
            let raw = (module.create)(args)?;
            let plugin = raw
                .downcast::<v1::Plugin>()
                .map_err(|_| PluginError::BadSymbol {
                    name: name.into(),
                    version,
                })?;
            tracing::info!(plugin = name, version, "plugin loaded");
            Ok(adapter::from_v1(*plugin))
        }
        version => Err(PluginError::PluginVersionUnknown {
            name: name.into(),
            version,
        }),
    }
}

/// Load the configured plugin, or the in-memory plugin when none is configured.
pub fn load(setting: Option<&PluginSetting>) -> Result<LoadedPlugin, PluginError> {
    match setting {
        Some(s) => load_from(BUILTIN_PLUGINS, &s.name, s.api_version, &s.args),
        None => load_from(BUILTIN_PLUGINS, MEMORY_PLUGIN_NAME, None, &v1::Args::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn future_version() -> u32 {
        7
    }

    fn not_a_plugin(_args: &v1::Args) -> Result<Box<dyn Any + Send>, PluginError> {
        Ok(Box::new(String::from("surprise")))
    }

    const FUTURE: PluginModule = PluginModule {
        name: "future",
        api_version: future_version,
        create: not_a_plugin,
    };

    fn one() -> u32 {
        1
    }

    const LIAR: PluginModule = PluginModule {
        name: "liar",
        api_version: one,
        create: not_a_plugin,
    };

    #[test]
    fn unknown_plugin_fails() {
        let r = load_from(BUILTIN_PLUGINS, "nope", None, &v1::Args::new());
        assert!(matches!(r, Err(PluginError::UnknownPlugin { .. })));
    }

    #[test]
    fn unknown_version_fails_fast() {
        let r = load_from(&[FUTURE], "future", None, &v1::Args::new());
        assert!(matches!(
            r,
            Err(PluginError::PluginVersionUnknown { version: 7, .. })
        ));
    }

    #[test]
    fn wrong_object_is_rejected() {
        let r = load_from(&[LIAR], "liar", None, &v1::Args::new());
        assert!(matches!(r, Err(PluginError::BadSymbol { .. })));
    }

    #[test]
    fn pinned_version_must_match() {
        let r = load_from(BUILTIN_PLUGINS, MEMORY_PLUGIN_NAME, Some(2), &v1::Args::new());
        assert!(matches!(r, Err(PluginError::VersionMismatch { .. })));
    }

    #[test]
    fn basic_plugin_requires_paths() {
        let r = load_from(BUILTIN_PLUGINS, BASIC_PLUGIN_NAME, None, &v1::Args::new());
        assert!(matches!(r, Err(PluginError::BadArgument { .. })));
    }

    #[test]
    fn default_is_memory() {
        assert!(load(None).is_ok());
    }
}
