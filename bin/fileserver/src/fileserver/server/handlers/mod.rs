pub mod admin;
pub mod contents;
pub mod files;
pub mod oauth2;
pub mod permissions;

use apikit::reject::HTTPError;

use crate::node::{AuthzError, FileManagerError, StorageError};

/// Maps a file manager failure onto the status the caller sees.
pub(super) fn file_error(e: FileManagerError) -> HTTPError {
    match e {
        FileManagerError::Unauthorized { .. } => HTTPError::Forbidden,
        FileManagerError::Storage { source } => match source {
            StorageError::NotFound { .. } => HTTPError::NotFound,
            StorageError::FileExists { .. } | StorageError::NotEmpty { .. } => {
                HTTPError::conflict(source)
            }
            StorageError::InvalidId { .. } => HTTPError::bad_request(source),
            other => HTTPError::internal_server_error(other),
        },
        FileManagerError::Authz { source } => match source {
            AuthzError::NoSuchPermission { .. } | AuthzError::UnknownOperation { .. } => {
                HTTPError::bad_request(source)
            }
            other => HTTPError::internal_server_error(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::node::Operation;

    #[test]
    fn file_errors_map_to_statuses() {
        let denied = FileManagerError::Unauthorized {
            user: "bob".into(),
            op: Operation::Read,
            object: "f1".into(),
        };
        assert_eq!(file_error(denied), HTTPError::Forbidden);

        let missing = FileManagerError::Storage {
            source: StorageError::NotFound { id: "f1".into() },
        };
        assert_eq!(file_error(missing), HTTPError::NotFound);

        let busy = FileManagerError::Storage {
            source: StorageError::NotEmpty { id: "f1".into() },
        };
        assert_eq!(
            file_error(busy),
            HTTPError::conflict("file 'f1' still has contents")
        );

        let bad_bits = FileManagerError::Authz {
            source: AuthzError::NoSuchPermission { bits: 0x10 },
        };
        assert!(matches!(
            file_error(bad_bits),
            HTTPError::BadRequest { .. }
        ));
    }
}
