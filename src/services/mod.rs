pub mod by_reference;
pub mod deposit_service;
pub mod fileset;
pub mod metadata_service;
pub mod record_store;
pub mod staging_service;
pub mod status;
pub mod storage_service;
pub mod tag_store;

use crate::models::deposit::Deposit;
use sqlx::SqliteConnection;
use storage_service::StorageService;

/// Everything an ingest step needs: the object store, the connection of the
/// enclosing transaction and the deposit being modified.
///
/// Object-store writes go through `conn`; changes to `deposit` are persisted
/// by whoever owns the transaction, after all object writes.
pub struct DepositTx<'a> {
    pub storage: &'a StorageService,
    pub conn: &'a mut SqliteConnection,
    pub deposit: &'a mut Deposit,
}
