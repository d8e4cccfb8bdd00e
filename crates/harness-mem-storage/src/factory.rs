use harness_mem_core::{BackendMode, CoreError, StorageConfig};

use crate::{SqliteStorageAdapter, StorageError};

/// Remote side of a hybrid or managed wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub workspace_uid: Option<String>,
}

pub struct AdapterFactoryResult {
    /// Local store. Serves every read and write in all modes; in managed mode
    /// it is a cache in front of the remote primary.
    pub adapter: SqliteStorageAdapter,
    /// Writes are only durable while the managed backend is connected.
    pub managed_required: bool,
    /// Present when a remote backend should be wired up.
    pub remote: Option<RemoteTarget>,
}

/// Open and migrate the local store for `config`, rejecting incomplete
/// configuration before anything is opened.
///
/// # Errors
/// Returns a configuration error when a setting required by the backend mode
/// is missing, or a storage error when the local database cannot be opened.
pub fn create_storage_adapter(
    config: &StorageConfig,
) -> Result<AdapterFactoryResult, StorageError> {
    config.validate()?;
    let db_path = config.db_path.as_deref().ok_or_else(|| {
        StorageError::Config(CoreError::Config("db_path is required".to_string()))
    })?;

    let adapter = SqliteStorageAdapter::open(db_path)?;
    adapter.migrate()?;

    let remote = match config.backend_mode {
        BackendMode::Local => None,
        BackendMode::Hybrid | BackendMode::Managed => {
            config.endpoint().map(|endpoint| RemoteTarget {
                endpoint: endpoint.to_string(),
                api_key: config.managed_api_key.clone(),
                workspace_uid: config.workspace_uid.clone(),
            })
        }
    };

    tracing::info!(
        backend_mode = %config.backend_mode,
        db_path = %db_path.display(),
        remote = remote.is_some(),
        "opened local storage adapter"
    );

    Ok(AdapterFactoryResult {
        adapter,
        managed_required: config.backend_mode == BackendMode::Managed,
        remote,
    })
}
