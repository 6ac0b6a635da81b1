use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use diesel::{Connection, PgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use tracing::instrument;
use url::Url;

use super::Params;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
static STORED_PARAMS: OnceLock<Params> = OnceLock::new();

/// Stores the connection parameters for [connect] and brings the schema up to date.
/// Must only be called once, and that is from main.rs
pub fn initialize(params: &Params) -> Result<()> {
    STORED_PARAMS
        .set(params.clone())
        .map_err(|_| anyhow!("database parameters were already initialised"))?;
    let mut conn = connect("schema_migration")?;

    debug!("Running any pending migrations now.");
    let migrations_run = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))
        .context("While running Postgres migrations")?;
    for migration in migrations_run {
        info!("Schema migration run: {}", migration);
    }
    Ok(())
}

#[instrument(name = "DB connect")]
pub fn connect(app_name: &str) -> Result<PgConnection> {
    let params = STORED_PARAMS
        .get()
        .ok_or_else(|| anyhow!("database parameters not initialised, call initialize() first"))?;
    connect_manual(app_name, params)
}

pub fn connect_manual(app_name: &str, params: &Params) -> Result<PgConnection> {
    let url = with_application_name(&params.database_url, app_name)?;
    PgConnection::establish(&url).context("while connecting to Postgres")
}

fn with_application_name(database_url: &str, app_name: &str) -> Result<String> {
    let mut url = Url::parse(database_url).context("parsing database URL")?;
    url.query_pairs_mut()
        .append_pair("application_name", app_name);

    // Postgres expects queries percent-encoded, but url encodes them as application/x-form-www-urlencoded
    // The subtle difference is that spaces are encoded as + in the latter and %20 in the former
    let query_percent_encoded = url.query().unwrap_or("").replace('+', "%20");
    url.set_query(Some(&query_percent_encoded));
    Ok(url.to_string())
}
