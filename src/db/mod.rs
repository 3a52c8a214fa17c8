mod cache;
pub mod constraint;
mod database;
mod index;
mod store;
mod txn;

pub use cache::{
    MetaCache, SchemaView, ATTRIBUTES_NAME, CHECK_BASE_OPTION, INDEXED_ATTR, INDEXES_NAME,
    META_NAME, OPTIONS_NAME, SEQUENCE_ATTR, WHEN_CHANGED_ATTR,
};
pub use database::Database;
pub use index::{IndexMaintainer, REF_ATTR};
pub use store::Store;
pub use txn::TxnCoordinator;
