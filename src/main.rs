//! docstore-tx - Main entry point.
//!
//! Probes a document store through the resolver: resolves a handle outside
//! and inside a transaction, provokes a duplicate key failure, and prints a
//! JSON report of what happened.

use clap::Parser;
use docstore_tx::config::{Config, StoreLocation};
use docstore_tx::driver::{ConnectionFactory, DatabaseHandle, MemoryClient};
use docstore_tx::error::{DriverError, ResolverError};
use docstore_tx::resolver::{
    do_get_database, get_database, is_database_transactional, release_database,
    translate_failure,
};
use docstore_tx::transaction::{current_transaction_id, run_in_transaction_async};
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[derive(Debug, Default, Serialize)]
struct ProbeReport {
    store: String,
    database: String,
    /// Outcome of resolving a handle outside any transaction
    non_transactional: String,
    transaction_id: Option<String>,
    /// Whether two resolutions inside one transaction returned the same handle
    reused_within_transaction: bool,
    /// Translation of the duplicate insert failure
    duplicate_insert: Option<String>,
}

async fn probe<F, I, Fut>(
    factory: Arc<F>,
    config: &Config,
    database: &str,
    insert: I,
) -> Result<ProbeReport, ResolverError>
where
    F: ConnectionFactory,
    I: Fn(F::Database, Value) -> Fut,
    Fut: Future<Output = Result<String, DriverError>>,
{
    let mut report = ProbeReport {
        store: factory.description(),
        database: database.to_string(),
        ..Default::default()
    };

    report.non_transactional = match do_get_database(&factory, database, config.allow_create) {
        Ok(db) => {
            let transactional = is_database_transactional(&db, Some(&factory));
            release_database(Some(&db));
            format!("opened (transactional: {})", transactional)
        }
        Err(e @ ResolverError::IllegalState { .. }) => format!("rejected: {}", e),
        Err(e) => return Err(e),
    };

    let probe_id = format!("probe-{}", uuid::Uuid::new_v4().simple());
    let (transaction_id, reused, duplicate) = run_in_transaction_async("probe", async {
        let first = get_database(&factory, database)?;
        let second = get_database(&factory, database)?;
        let reused = first.same_handle(&second);

        let doc = json!({ "_id": probe_id, "at": chrono::Utc::now().to_rfc3339() });
        insert(first.clone(), doc.clone()).await?;
        let duplicate = match insert(second, doc).await {
            Ok(id) => {
                error!(id = %id, "Duplicate insert unexpectedly succeeded");
                None
            }
            Err(e) => translate_failure(&e).map(|translated| translated.to_string()),
        };

        Ok::<_, ResolverError>((current_transaction_id(), reused, duplicate))
    })
    .await?;

    report.transaction_id = transaction_id;
    report.reused_within_transaction = reused;
    report.duplicate_insert = duplicate;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let store = config.store()?;
    let database = config.database_name(&store);

    info!(
        database = %database,
        allow_create = config.allow_create,
        "Starting docstore-tx probe v{}",
        env!("CARGO_PKG_VERSION")
    );

    let collection = config.collection.clone();
    let result = match &store.location {
        StoreLocation::Memory => {
            let client = Arc::new(MemoryClient::new());
            probe(client, &config, &database, |db, doc| {
                let collection = collection.clone();
                async move { db.insert_one(&collection, doc) }
            })
            .await
        }
        StoreLocation::SqliteDir(_) | StoreLocation::Postgres(_) => {
            let Some(client) = store.sql_client()? else {
                return Err("store has no SQL client".into());
            };
            let client = Arc::new(client);
            let result = probe(Arc::clone(&client), &config, &database, |db, doc| {
                let collection = collection.clone();
                async move { db.insert_one(&collection, doc).await }
            })
            .await;
            client.close_all().await;
            result
        }
    };

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("Probe complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Probe failed");
            Err(e.into())
        }
    }
}
