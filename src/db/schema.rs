//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{FulfillmentError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(INVENTORY_SCHEMA)
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to create inventory tables: {}", e)))?;
        conn.execute_batch(REQUESTS_SCHEMA)
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to create request tables: {}", e)))?;
        conn.execute_batch(INDEXES_SCHEMA)
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to create indexes: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| FulfillmentError::Persistence(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Tree inventory
const INVENTORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tree_units (
    id INTEGER PRIMARY KEY NOT NULL,
    sapling_id TEXT NOT NULL,
    plot_id INTEGER NOT NULL,
    plant_type TEXT NOT NULL,
    habit TEXT NOT NULL DEFAULT 'Tree',
    giftable INTEGER NOT NULL DEFAULT 1,

    -- Reservation
    reserved_by_request INTEGER,
    sponsor_user INTEGER,
    sponsor_group INTEGER,
    mapped_at TEXT,

    -- Assignment
    assigned_recipient INTEGER,
    assigned_assignee INTEGER,
    assigned_at TEXT,
    description TEXT,
    event_type TEXT,
    gifted_by INTEGER,
    gifted_by_name TEXT,
    user_tree_image TEXT,

    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Card template slot per plant type
CREATE TABLE IF NOT EXISTS plant_type_templates (
    plant_type TEXT PRIMARY KEY NOT NULL,
    template_slot_id TEXT NOT NULL
);
"#;

/// Requests, recipient quotas and card artifacts
const REQUESTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY NOT NULL,
    request_key TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'donation',
    sponsor_user INTEGER NOT NULL,
    sponsor_group INTEGER,
    sponsor_name TEXT NOT NULL DEFAULT '',
    pledged_count INTEGER NOT NULL,
    diversify INTEGER NOT NULL DEFAULT 0,
    include_all_habits INTEGER NOT NULL DEFAULT 0,
    include_non_giftable INTEGER NOT NULL DEFAULT 0,
    -- Plot demands as JSON array of {plot_id, desired_count}
    plots_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending_plot_selection',

    event_type TEXT,
    event_name TEXT,
    gifted_on TEXT,
    gifted_by_name TEXT,
    primary_message TEXT NOT NULL,
    secondary_message TEXT NOT NULL,
    logo_url TEXT,
    logo_message TEXT NOT NULL,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS recipient_quotas (
    id INTEGER PRIMARY KEY NOT NULL,
    request_id INTEGER NOT NULL,
    recipient INTEGER NOT NULL,
    assignee INTEGER NOT NULL,
    requested_count INTEGER NOT NULL,
    recipient_name TEXT NOT NULL DEFAULT '',
    assignee_name TEXT NOT NULL DEFAULT '',
    recipient_email TEXT,
    relation TEXT,
    profile_image_url TEXT,
    mail_sent INTEGER NOT NULL DEFAULT 0,
    mail_error TEXT,
    FOREIGN KEY (request_id) REFERENCES requests(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS card_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL,
    unit_id INTEGER NOT NULL,
    quota_id INTEGER,
    slide_id TEXT,
    container_id TEXT,
    image_url TEXT,
    render_error TEXT,
    render_retries INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (request_id, unit_id)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_units_plot ON tree_units(plot_id);
CREATE INDEX IF NOT EXISTS idx_units_request ON tree_units(reserved_by_request);
CREATE INDEX IF NOT EXISTS idx_quotas_request ON recipient_quotas(request_id);
CREATE INDEX IF NOT EXISTS idx_cards_request ON card_artifacts(request_id);
"#;
