//! Document driver abstraction.
//!
//! This module defines the seam between the resolver and a concrete driver:
//! - [`ConnectionFactory`]: hands out database handles by name
//! - [`DatabaseHandle`]: a cheap, cloneable handle with its own identity
//!
//! Two drivers ship with the crate: an in-memory client ([`memory`]) and a
//! sqlx-backed client for SQLite and PostgreSQL ([`sql`]).

pub mod memory;
pub mod sql;

use crate::error::DriverError;
use serde_json::Value;

pub use memory::{MemoryClient, MemoryDatabase};
pub use sql::{SqlBackend, SqlClient, SqlDatabase};

/// A connection to a document store cluster that opens database handles.
///
/// Factories are shared as `Arc<F>` and compared by identity.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Database: DatabaseHandle;

    /// Open a handle to the named database.
    fn get_database(&self, name: &str) -> Result<Self::Database, DriverError>;

    /// Human readable description for logs (never contains credentials).
    fn description(&self) -> String;
}

/// A handle to one database, as returned by [`ConnectionFactory::get_database`].
pub trait DatabaseHandle: Clone + Send + 'static {
    /// Name of the database this handle targets.
    fn name(&self) -> &str;

    /// Whether `other` is the very same handle (not merely the same database).
    fn same_handle(&self, other: &Self) -> bool;

    /// Signal the driver that the current request on this handle is finished.
    fn request_done(&self) -> Result<(), DriverError>;
}

/// Reject database names no backend can store.
pub(crate) fn validate_database_name(name: &str) -> Result<(), DriverError> {
    if name.is_empty() {
        return Err(DriverError::invalid_name(name, "name cannot be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '.' | ' ' | '"' | '$' | '\0'))
    {
        return Err(DriverError::invalid_name(
            name,
            format!("character {:?} is not allowed", c),
        ));
    }
    Ok(())
}

/// Extract the `_id` of a document, generating one when absent.
pub(crate) fn document_id(document: &mut Value) -> Result<String, DriverError> {
    let Some(fields) = document.as_object_mut() else {
        return Err(DriverError::command("bad_value", "document must be an object"));
    };
    match fields.get("_id") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(DriverError::command(
            "bad_value",
            format!("unsupported _id type: {}", other),
        )),
        None => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            fields.insert("_id".to_string(), Value::String(id.clone()));
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id() {
        assert_eq!(document_id(&mut json!({"_id": "a"})).unwrap(), "a");
        assert_eq!(document_id(&mut json!({"_id": 42})).unwrap(), "42");
        assert!(document_id(&mut json!({"_id": [1]})).is_err());
        assert!(document_id(&mut json!("scalar")).is_err());

        let mut doc = json!({"name": "x"});
        let id = document_id(&mut doc).unwrap();
        assert_eq!(doc["_id"], id.as_str());
    }

    #[test]
    fn test_validate_database_name() {
        assert!(validate_database_name("orders").is_ok());
        assert!(validate_database_name("orders_2024").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("a/b").is_err());
        assert!(validate_database_name("a.b").is_err());
        assert!(validate_database_name("$cmd").is_err());
    }
}
