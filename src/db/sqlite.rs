//! SQLite-backed tree store

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::schema;
use super::{TreeStore, UnitFilter, UnitPatch, UnitSelector};
use crate::error::{FulfillmentError, Result};
use crate::models::{
    current_timestamp, CardArtifact, EligibilityFilter, PlotDemand, RecipientQuota, RequestStatus,
    ReservationRequest, TreeUnit, TREE_HABIT,
};

const FREE_CONDITION: &str = "reserved_by_request IS NULL AND sponsor_user IS NULL AND sponsor_group IS NULL \
     AND assigned_recipient IS NULL AND assigned_assignee IS NULL";

/// SQLite database for tree inventory and requests
pub struct SqliteTreeStore {
    conn: Mutex<Connection>,
}

impl SqliteTreeStore {
    /// Open or create the database file
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| FulfillmentError::Persistence(format!("Failed to open in-memory SQLite: {}", e)))?;
        schema::init_schema(&conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FulfillmentError::Persistence(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

fn unit_from_row(row: &Row) -> rusqlite::Result<TreeUnit> {
    Ok(TreeUnit {
        id: row.get("id")?,
        sapling_id: row.get("sapling_id")?,
        plot_id: row.get("plot_id")?,
        plant_type: row.get("plant_type")?,
        habit: row.get("habit")?,
        giftable: row.get("giftable")?,
        reserved_by_request: row.get("reserved_by_request")?,
        sponsor_user: row.get("sponsor_user")?,
        sponsor_group: row.get("sponsor_group")?,
        mapped_at: row.get("mapped_at")?,
        assigned_recipient: row.get("assigned_recipient")?,
        assigned_assignee: row.get("assigned_assignee")?,
        assigned_at: row.get("assigned_at")?,
        description: row.get("description")?,
        event_type: row.get("event_type")?,
        gifted_by: row.get("gifted_by")?,
        gifted_by_name: row.get("gifted_by_name")?,
        user_tree_image: row.get("user_tree_image")?,
        updated_at: row.get("updated_at")?,
    })
}

fn request_from_row(row: &Row) -> Result<ReservationRequest> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    let plots_json: String = row.get("plots_json")?;
    let plots: Vec<PlotDemand> = serde_json::from_str(&plots_json)?;
    let pledged: i64 = row.get("pledged_count")?;

    Ok(ReservationRequest {
        id: row.get("id")?,
        request_key: row.get("request_key")?,
        kind: kind.parse()?,
        sponsor_user: row.get("sponsor_user")?,
        sponsor_group: row.get("sponsor_group")?,
        sponsor_name: row.get("sponsor_name")?,
        pledged_count: pledged.max(0) as usize,
        diversify: row.get("diversify")?,
        include_all_habits: row.get("include_all_habits")?,
        include_non_giftable: row.get("include_non_giftable")?,
        plots,
        status: status.parse()?,
        event_type: row.get("event_type")?,
        event_name: row.get("event_name")?,
        gifted_on: row.get("gifted_on")?,
        gifted_by_name: row.get("gifted_by_name")?,
        primary_message: row.get("primary_message")?,
        secondary_message: row.get("secondary_message")?,
        logo_url: row.get("logo_url")?,
        logo_message: row.get("logo_message")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn quota_from_row(row: &Row) -> rusqlite::Result<RecipientQuota> {
    let requested: i64 = row.get("requested_count")?;
    Ok(RecipientQuota {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        recipient: row.get("recipient")?,
        assignee: row.get("assignee")?,
        requested_count: requested.max(0) as usize,
        recipient_name: row.get("recipient_name")?,
        assignee_name: row.get("assignee_name")?,
        recipient_email: row.get("recipient_email")?,
        relation: row.get("relation")?,
        profile_image_url: row.get("profile_image_url")?,
        mail_sent: row.get("mail_sent")?,
        mail_error: row.get("mail_error")?,
    })
}

fn card_from_row(row: &Row) -> rusqlite::Result<CardArtifact> {
    Ok(CardArtifact {
        id: row.get("id")?,
        request_id: row.get("request_id")?,
        unit_id: row.get("unit_id")?,
        quota_id: row.get("quota_id")?,
        slide_id: row.get("slide_id")?,
        container_id: row.get("container_id")?,
        image_url: row.get("image_url")?,
        render_error: row.get("render_error")?,
        render_retries: row.get("render_retries")?,
        updated_at: row.get("updated_at")?,
    })
}

// ============================================================================
// SQL Builders
// ============================================================================

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn filter_clause(filter: &UnitFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut conditions = vec![];
    let mut params: Vec<Box<dyn ToSql>> = vec![];

    if let Some(ref ids) = filter.ids {
        if ids.is_empty() {
            conditions.push("0".to_string());
        } else {
            conditions.push(format!("id IN ({})", placeholders(ids.len())));
            params.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>));
        }
    }
    if let Some(request_id) = filter.request_id {
        conditions.push("reserved_by_request = ?".to_string());
        params.push(Box::new(request_id));
    }
    if filter.free_only {
        conditions.push(FREE_CONDITION.to_string());
    }

    if conditions.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), params)
    }
}

fn patch_clause(patch: &UnitPatch) -> (String, Vec<Box<dyn ToSql>>) {
    let now = current_timestamp();
    match patch {
        UnitPatch::Reserve {
            request_id,
            sponsor_user,
            sponsor_group,
        } => (
            "reserved_by_request = ?, sponsor_user = ?, sponsor_group = ?, mapped_at = ?, updated_at = ?".into(),
            vec![
                Box::new(*request_id),
                Box::new(*sponsor_user),
                Box::new(*sponsor_group),
                Box::new(now.clone()),
                Box::new(now),
            ],
        ),
        UnitPatch::ClearReservation => (
            "reserved_by_request = NULL, sponsor_user = NULL, sponsor_group = NULL, mapped_at = NULL, updated_at = ?"
                .into(),
            vec![Box::new(now)],
        ),
        UnitPatch::Assign(fields) => (
            "assigned_recipient = ?, assigned_assignee = ?, assigned_at = ?, description = ?, event_type = ?, \
             gifted_by = ?, gifted_by_name = ?, user_tree_image = ?, updated_at = ?"
                .into(),
            vec![
                Box::new(fields.recipient),
                Box::new(fields.assignee),
                Box::new(fields.assigned_at.clone()),
                Box::new(fields.description.clone()),
                Box::new(fields.event_type.clone()),
                Box::new(fields.gifted_by),
                Box::new(fields.gifted_by_name.clone()),
                Box::new(fields.user_tree_image.clone()),
                Box::new(now),
            ],
        ),
        UnitPatch::ClearAssignment => (
            "assigned_recipient = NULL, assigned_assignee = NULL, assigned_at = NULL, description = NULL, \
             event_type = NULL, gifted_by = NULL, gifted_by_name = NULL, user_tree_image = NULL, updated_at = ?"
                .into(),
            vec![Box::new(now)],
        ),
    }
}

// ============================================================================
// TreeStore
// ============================================================================

#[async_trait]
impl TreeStore for SqliteTreeStore {
    async fn fetch_free_units(&self, plot_id: i64, limit: usize, filter: EligibilityFilter) -> Result<Vec<TreeUnit>> {
        let mut conditions = vec!["plot_id = ?".to_string(), FREE_CONDITION.to_string()];
        if !filter.include_non_giftable {
            conditions.push("giftable = 1".to_string());
        }
        if !filter.include_all_habits {
            conditions.push(format!("habit = '{}'", TREE_HABIT));
        }
        let where_clause = conditions.join(" AND ");

        let sql = if filter.diversify {
            format!(
                "SELECT * FROM (SELECT *, ROW_NUMBER() OVER (PARTITION BY plant_type ORDER BY id) AS type_rank \
                 FROM tree_units WHERE {}) WHERE type_rank <= ? ORDER BY id",
                where_clause
            )
        } else {
            format!("SELECT * FROM tree_units WHERE {} ORDER BY id LIMIT ?", where_clause)
        };

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let units = stmt
                .query_map(params![plot_id, limit as i64], unit_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            debug!(plot_id = plot_id, fetched = units.len(), "Fetched free units");
            Ok(units)
        })
    }

    async fn count_units(&self, filter: &UnitFilter) -> Result<usize> {
        let (where_clause, params) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM tree_units{}", where_clause);

        self.with_conn(|conn| {
            let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
    }

    async fn update_units(&self, selector: &UnitSelector, patch: &UnitPatch) -> Result<usize> {
        let (set_clause, mut params) = patch_clause(patch);
        let where_clause = match selector {
            UnitSelector::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(0);
                }
                params.extend(ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>));
                format!("id IN ({})", placeholders(ids.len()))
            }
            UnitSelector::Request(request_id) => {
                params.push(Box::new(*request_id));
                "reserved_by_request = ?".to_string()
            }
        };
        let sql = format!("UPDATE tree_units SET {} WHERE {}", set_clause, where_clause);

        self.with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(params.iter()))?))
    }

    async fn list_request_units(&self, request_id: i64) -> Result<Vec<TreeUnit>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tree_units WHERE reserved_by_request = ? ORDER BY id")?;
            let units = stmt
                .query_map(params![request_id], unit_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(units)
        })
    }

    async fn insert_units(&self, units: &[TreeUnit]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| FulfillmentError::Persistence(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tree_units (id, sapling_id, plot_id, plant_type, habit, giftable, \
                 reserved_by_request, sponsor_user, sponsor_group, mapped_at, assigned_recipient, assigned_assignee, \
                 assigned_at, description, event_type, gifted_by, gifted_by_name, user_tree_image, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for unit in units {
                stmt.execute(params![
                    unit.id,
                    unit.sapling_id,
                    unit.plot_id,
                    unit.plant_type,
                    unit.habit,
                    unit.giftable,
                    unit.reserved_by_request,
                    unit.sponsor_user,
                    unit.sponsor_group,
                    unit.mapped_at,
                    unit.assigned_recipient,
                    unit.assigned_assignee,
                    unit.assigned_at,
                    unit.description,
                    unit.event_type,
                    unit.gifted_by,
                    unit.gifted_by_name,
                    unit.user_tree_image,
                    unit.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = units.len(), "Inserted tree units");
        Ok(())
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<ReservationRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM requests WHERE id = ?")?;
            let mut rows = stmt.query(params![request_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(request_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    async fn insert_request(&self, request: &ReservationRequest) -> Result<()> {
        let plots_json = serde_json::to_string(&request.plots)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO requests (id, request_key, kind, sponsor_user, sponsor_group, sponsor_name, \
                 pledged_count, diversify, include_all_habits, include_non_giftable, plots_json, status, event_type, \
                 event_name, gifted_on, gifted_by_name, primary_message, secondary_message, logo_url, logo_message, \
                 created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    request.id,
                    request.request_key,
                    request.kind.as_str(),
                    request.sponsor_user,
                    request.sponsor_group,
                    request.sponsor_name,
                    request.pledged_count as i64,
                    request.diversify,
                    request.include_all_habits,
                    request.include_non_giftable,
                    plots_json,
                    request.status.as_str(),
                    request.event_type,
                    request.event_name,
                    request.gifted_on,
                    request.gifted_by_name,
                    request.primary_message,
                    request.secondary_message,
                    request.logo_url,
                    request.logo_message,
                    request.created_at,
                    request.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    async fn update_request_status(&self, request_id: i64, status: RequestStatus) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE requests SET status = ?, updated_at = ? WHERE id = ?",
                params![status.as_str(), current_timestamp(), request_id],
            )?;
            if updated == 0 {
                return Err(FulfillmentError::NotFound(format!("request {}", request_id)));
            }
            Ok(())
        })
    }

    async fn read_quotas(&self, request_id: i64) -> Result<Vec<RecipientQuota>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM recipient_quotas WHERE request_id = ? ORDER BY id")?;
            let quotas = stmt
                .query_map(params![request_id], quota_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(quotas)
        })
    }

    async fn upsert_quota(&self, quota: &RecipientQuota) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO recipient_quotas (id, request_id, recipient, assignee, requested_count, \
                 recipient_name, assignee_name, recipient_email, relation, profile_image_url, mail_sent, mail_error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    quota.id,
                    quota.request_id,
                    quota.recipient,
                    quota.assignee,
                    quota.requested_count as i64,
                    quota.recipient_name,
                    quota.assignee_name,
                    quota.recipient_email,
                    quota.relation,
                    quota.profile_image_url,
                    quota.mail_sent,
                    quota.mail_error,
                ],
            )?;
            Ok(())
        })
    }

    async fn delete_quotas(&self, request_id: i64, quota_ids: &[i64]) -> Result<usize> {
        if quota_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM recipient_quotas WHERE request_id = ? AND id IN ({})",
            placeholders(quota_ids.len())
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(request_id)];
        params.extend(quota_ids.iter().map(|id| Box::new(*id) as Box<dyn ToSql>));

        self.with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(params.iter()))?))
    }

    async fn update_quota_mail(&self, quota_id: i64, mail_sent: bool, mail_error: Option<String>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE recipient_quotas SET mail_sent = ?, mail_error = ? WHERE id = ?",
                params![mail_sent, mail_error, quota_id],
            )?;
            Ok(())
        })
    }

    async fn template_slots(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT plant_type, template_slot_id FROM plant_type_templates")?;
            let slots = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(slots)
        })
    }

    async fn set_template_slot(&self, plant_type: &str, slot_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO plant_type_templates (plant_type, template_slot_id) VALUES (?, ?)",
                params![plant_type, slot_id],
            )?;
            Ok(())
        })
    }

    async fn list_cards(&self, request_id: i64) -> Result<Vec<CardArtifact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM card_artifacts WHERE request_id = ? ORDER BY id")?;
            let cards = stmt
                .query_map(params![request_id], card_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(cards)
        })
    }

    async fn insert_card(&self, request_id: i64, unit_id: i64, quota_id: Option<i64>) -> Result<CardArtifact> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO card_artifacts (request_id, unit_id, quota_id, updated_at) VALUES (?, ?, ?, ?)",
                params![request_id, unit_id, quota_id, current_timestamp()],
            )?;
            let id = conn.last_insert_rowid();
            let card = conn
                .query_row("SELECT * FROM card_artifacts WHERE id = ?", params![id], card_from_row)
                .optional()?
                .ok_or_else(|| FulfillmentError::Persistence(format!("card {} vanished after insert", id)))?;
            Ok(card)
        })
    }

    async fn update_card(&self, card: &CardArtifact) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE card_artifacts SET quota_id = ?, slide_id = ?, container_id = ?, image_url = ?, \
                 render_error = ?, render_retries = ?, updated_at = ? WHERE id = ?",
                params![
                    card.quota_id,
                    card.slide_id,
                    card.container_id,
                    card.image_url,
                    card.render_error,
                    card.render_retries,
                    current_timestamp(),
                    card.id,
                ],
            )?;
            if updated == 0 {
                return Err(FulfillmentError::NotFound(format!("card {}", card.id)));
            }
            Ok(())
        })
    }
}
