//! docstore-tx
//!
//! Transaction-scoped database handle resolution for document drivers:
//! handles resolved inside a transaction are bound to it and reused, released
//! when it completes, and driver failures are translated into a
//! driver-independent error taxonomy.

pub mod config;
pub mod driver;
pub mod error;
pub mod holder;
pub mod resolver;
pub mod transaction;

pub use config::{Config, StoreConfig};
pub use driver::{ConnectionFactory, DatabaseHandle};
pub use error::{DataAccessError, DriverError, ResolverError, TransactionError};
pub use holder::DbHolder;
pub use resolver::{
    do_get_database, get_database, is_database_transactional, release_database,
    translate_failure,
};
