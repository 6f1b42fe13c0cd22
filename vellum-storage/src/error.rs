//! LMDB error wrapper.
//!
//! `heed::Error` and `VellumError` are both foreign to this crate, so LMDB
//! failures pass through [`LmdbStoreError`] on their way to the master error.

use vellum_core::{InitError, StorageError, VellumError, VellumResult};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    /// A `NO_OVERWRITE` put hit an existing key.
    #[error("Duplicate key in table {table}")]
    KeyExists { table: &'static str },

    /// Any other transaction or cursor error.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl From<heed::Error> for LmdbStoreError {
    fn from(e: heed::Error) -> Self {
        LmdbStoreError::Transaction(e.to_string())
    }
}

/// Convert LmdbStoreError to VellumError.
impl From<LmdbStoreError> for VellumError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::EnvOpen { path, reason } => {
                VellumError::Init(InitError::Open { path, reason })
            }
            LmdbStoreError::KeyExists { table } => {
                VellumError::Storage(StorageError::UniqueViolation {
                    table: table.to_string(),
                })
            }
            LmdbStoreError::Transaction(reason) => {
                VellumError::Storage(StorageError::TransactionFailed { reason })
            }
        }
    }
}

/// Shorthand for lifting heed results into vellum results.
pub(crate) trait LmdbResultExt<T> {
    fn lmdb(self) -> VellumResult<T>;
}

impl<T> LmdbResultExt<T> for Result<T, heed::Error> {
    fn lmdb(self) -> VellumResult<T> {
        self.map_err(|e| LmdbStoreError::from(e).into())
    }
}

/// Map a failed `NO_OVERWRITE` put to a uniqueness violation on `table`.
pub(crate) fn unique_put(result: Result<(), heed::Error>, table: &'static str) -> VellumResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(heed::Error::Mdb(heed::MdbError::KeyExist)) => {
            Err(LmdbStoreError::KeyExists { table }.into())
        }
        Err(e) => Err(LmdbStoreError::from(e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exists_maps_to_unique_violation() {
        let err = unique_put(Err(heed::Error::Mdb(heed::MdbError::KeyExist)), "object")
            .expect_err("duplicate should fail");
        assert_eq!(
            err,
            VellumError::Storage(StorageError::UniqueViolation {
                table: "object".to_string()
            })
        );
    }

    #[test]
    fn test_env_open_maps_to_init_failure() {
        let err: VellumError = LmdbStoreError::EnvOpen {
            path: "/nope".to_string(),
            reason: "permission denied".to_string(),
        }
        .into();
        assert!(err.is_init_failure());
    }

    #[test]
    fn test_other_errors_map_to_transaction_failed() {
        let err = unique_put(Err(heed::Error::Mdb(heed::MdbError::MapFull)), "collection")
            .expect_err("map full should fail");
        assert!(matches!(
            err,
            VellumError::Storage(StorageError::TransactionFailed { .. })
        ));
    }
}
