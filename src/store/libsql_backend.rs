//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text (sortable); job due times as unix millis.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection as LibSqlConnection, Database as LibSqlDatabase, Row, params};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::automation::delivery::{DeliveryStatus, ScheduledResponse};
use crate::automation::relay::{OutboxStatus, RelayOutboxEntry};
use crate::automation::rule::{RelayTarget, Rule, RuleKind};
use crate::automation::trigger::{TriggerCondition, TriggerType};
use crate::error::{DatabaseError, RuleError};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::types::{AgentSetting, Connection, Contact, Deal, Origin, Sequence, Tag};
use crate::webhooks::model::WebhookConfig;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: LibSqlConnection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &LibSqlConnection {
        &self.conn
    }

    /// Run a query and map its first row.
    async fn fetch_one<T>(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }

    /// Run a query and map every row; rows that fail to decode are skipped.
    async fn fetch_all<T>(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match map(&row) {
                Ok(item) => out.push(item),
                Err(e) => tracing::warn!("{context}: skipping row: {e}"),
            }
        }
        Ok(out)
    }

    async fn execute(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, microseconds, `Z` suffix.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row decode: {e}"))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn opt_uuid(s: Option<String>) -> Option<Uuid> {
    s.and_then(|s| Uuid::parse_str(&s).ok())
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_id(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const CONTACT_COLUMNS: &str =
    "id, owner_id, phone, name, email, metadata, origin_id, profile_picture, created_at, updated_at";

fn row_to_contact(row: &Row) -> Result<Contact, DatabaseError> {
    let metadata_str: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
    Ok(Contact {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        phone: row.get(2).map_err(row_err)?,
        name: row.get::<String>(3).ok(),
        email: row.get::<String>(4).ok(),
        metadata: parse_json::<Map<String, Value>>(&metadata_str, "contact metadata")?,
        origin_id: opt_uuid(row.get::<String>(6).ok()),
        profile_picture: row.get::<String>(7).ok(),
        created_at: parse_datetime(&row.get::<String>(8).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(9).unwrap_or_default()),
    })
}

fn row_to_tag(row: &Row) -> Result<Tag, DatabaseError> {
    Ok(Tag {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        color: row.get(3).map_err(row_err)?,
    })
}

fn row_to_connection(row: &Row) -> Result<Connection, DatabaseError> {
    Ok(Connection {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        instance: row.get(3).map_err(row_err)?,
    })
}

fn row_to_origin(row: &Row) -> Result<Origin, DatabaseError> {
    Ok(Origin {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
    })
}

fn row_to_deal(row: &Row) -> Result<Deal, DatabaseError> {
    Ok(Deal {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        contact_id: parse_uuid(&row.get::<String>(1).map_err(row_err)?)?,
        funnel_name: row.get(2).map_err(row_err)?,
        stage: row.get(3).map_err(row_err)?,
        updated_at: parse_datetime(&row.get::<String>(4).unwrap_or_default()),
    })
}

fn row_to_sequence(row: &Row) -> Result<Sequence, DatabaseError> {
    Ok(Sequence {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        active: row.get::<i64>(3).unwrap_or(0) != 0,
    })
}

fn row_to_agent_setting(row: &Row) -> Result<AgentSetting, DatabaseError> {
    Ok(AgentSetting {
        contact_id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        enabled: row.get::<i64>(1).unwrap_or(0) != 0,
        toggled_at: parse_datetime(&row.get::<String>(2).unwrap_or_default()),
        disabled_reason: row.get::<String>(3).ok(),
    })
}

const RULE_COLUMNS: &str = "id, owner_id, name, active, kind, keywords, trigger_type, trigger_config, responses, relay_enabled, relay_url, relay_custom_fields, tags_to_add, origin_id, execution_count, created_at, updated_at";

/// Decode a rule row. Unknown kinds, trigger types and operators are errors,
/// so list queries skip (and log) rules that cannot be evaluated.
fn row_to_rule(row: &Row) -> Result<Rule, DatabaseError> {
    let kind_str: String = row.get(4).map_err(row_err)?;
    let kind = match kind_str.as_str() {
        "keyword" => {
            let keywords_str: String = row.get(5).unwrap_or_else(|_| "[]".to_string());
            RuleKind::Keyword {
                keywords: parse_json(&keywords_str, "rule keywords")?,
            }
        }
        "trigger" => {
            let trigger_type: String = row.get::<String>(6).unwrap_or_default();
            let config_str: String = row.get(7).unwrap_or_else(|_| "{}".to_string());
            let config: Value = parse_json(&config_str, "trigger config")?;
            let condition = TriggerCondition::from_db(&trigger_type, &config)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            RuleKind::Trigger { condition }
        }
        other => {
            return Err(DatabaseError::Serialization(
                RuleError::UnknownKind(other.to_string()).to_string(),
            ));
        }
    };

    let responses_str: String = row.get(8).unwrap_or_else(|_| "[]".to_string());
    let relay_fields_str: String = row.get(11).unwrap_or_else(|_| "{}".to_string());
    let tags_str: String = row.get(12).unwrap_or_else(|_| "[]".to_string());

    Ok(Rule {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        active: row.get::<i64>(3).unwrap_or(0) != 0,
        kind,
        responses: parse_json(&responses_str, "rule responses")?,
        relay: RelayTarget::from_db(
            row.get::<i64>(9).unwrap_or(0) != 0,
            row.get::<String>(10).ok(),
            parse_json(&relay_fields_str, "relay custom fields")?,
        ),
        tags_to_add: parse_json(&tags_str, "rule tags")?,
        origin_id: opt_uuid(row.get::<String>(13).ok()),
        execution_count: row.get::<i64>(14).unwrap_or(0).max(0) as u64,
        created_at: parse_datetime(&row.get::<String>(15).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(16).unwrap_or_default()),
    })
}

const WEBHOOK_COLUMNS: &str = "id, owner_id, name, active, connection_id, field_mappings, actions, total_received, last_payload, last_received_at, created_at, updated_at";

fn row_to_webhook(row: &Row) -> Result<WebhookConfig, DatabaseError> {
    let mappings_str: String = row.get(5).unwrap_or_else(|_| "[]".to_string());
    let actions_str: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let last_payload = match row.get::<String>(8).ok() {
        Some(s) => Some(parse_json::<Value>(&s, "webhook last payload")?),
        None => None,
    };

    Ok(WebhookConfig {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        owner_id: row.get(1).map_err(row_err)?,
        name: row.get(2).map_err(row_err)?,
        active: row.get::<i64>(3).unwrap_or(0) != 0,
        connection_id: opt_uuid(row.get::<String>(4).ok()),
        field_mappings: parse_json(&mappings_str, "webhook field mappings")?,
        actions: parse_json(&actions_str, "webhook actions")?,
        total_received: row.get::<i64>(7).unwrap_or(0).max(0) as u64,
        last_payload,
        last_received_at: parse_optional_datetime(row.get::<String>(9).ok()),
        created_at: parse_datetime(&row.get::<String>(10).unwrap_or_default()),
        updated_at: parse_datetime(&row.get::<String>(11).unwrap_or_default()),
    })
}

const SCHEDULED_COLUMNS: &str = "id, execution_id, rule_id, contact_id, phone, instance, step, order_index, kind, content, delay_seconds, due_at_ms, status, last_error, finished_at, created_at";

fn row_to_scheduled(row: &Row) -> Result<ScheduledResponse, DatabaseError> {
    let kind_str: String = row.get(8).map_err(row_err)?;
    let status_str: String = row.get(12).map_err(row_err)?;

    Ok(ScheduledResponse {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        execution_id: parse_uuid(&row.get::<String>(1).map_err(row_err)?)?,
        rule_id: parse_uuid(&row.get::<String>(2).map_err(row_err)?)?,
        contact_id: parse_uuid(&row.get::<String>(3).map_err(row_err)?)?,
        phone: row.get(4).map_err(row_err)?,
        instance: row.get::<String>(5).ok(),
        step: row.get::<i64>(6).map_err(row_err)? as u32,
        order_index: row.get::<i64>(7).unwrap_or(0) as i32,
        kind: kind_str
            .parse()
            .map_err(|e: RuleError| DatabaseError::Serialization(e.to_string()))?,
        content: row.get(9).map_err(row_err)?,
        delay_seconds: row.get::<i64>(10).unwrap_or(0).max(0) as u32,
        due_at_ms: row.get::<i64>(11).ok(),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        last_error: row.get::<String>(13).ok(),
        finished_at: parse_optional_datetime(row.get::<String>(14).ok()),
        created_at: parse_datetime(&row.get::<String>(15).unwrap_or_default()),
    })
}

const RELAY_COLUMNS: &str =
    "id, rule_id, url, payload, attempts, next_attempt_ms, status, last_error, created_at, delivered_at";

fn row_to_relay(row: &Row) -> Result<RelayOutboxEntry, DatabaseError> {
    let payload_str: String = row.get(3).map_err(row_err)?;
    let status_str: String = row.get(6).map_err(row_err)?;

    Ok(RelayOutboxEntry {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        rule_id: parse_uuid(&row.get::<String>(1).map_err(row_err)?)?,
        url: row.get(2).map_err(row_err)?,
        payload: parse_json(&payload_str, "relay payload")?,
        attempts: row.get::<i64>(4).unwrap_or(0).max(0) as u32,
        next_attempt_ms: row.get::<i64>(5).unwrap_or(0),
        status: status_str.parse::<OutboxStatus>().map_err(DatabaseError::Serialization)?,
        last_error: row.get::<String>(7).ok(),
        created_at: parse_datetime(&row.get::<String>(8).unwrap_or_default()),
        delivered_at: parse_optional_datetime(row.get::<String>(9).ok()),
    })
}

fn row_to_id(row: &Row) -> Result<Uuid, DatabaseError> {
    parse_uuid(&row.get::<String>(0).map_err(row_err)?)
}

fn row_to_i64(row: &Row) -> Result<i64, DatabaseError> {
    row.get::<i64>(0).map_err(row_err)
}

fn row_to_string(row: &Row) -> Result<String, DatabaseError> {
    row.get::<String>(0).map_err(row_err)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Connections ─────────────────────────────────────────────────

    async fn create_connection(&self, connection: &Connection) -> Result<(), DatabaseError> {
        self.execute(
            "create_connection",
            "INSERT INTO connections (id, owner_id, name, instance) VALUES (?1, ?2, ?3, ?4)",
            params![
                connection.id.to_string(),
                connection.owner_id.clone(),
                connection.name.clone(),
                connection.instance.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<Connection>, DatabaseError> {
        self.fetch_one(
            "get_connection",
            "SELECT id, owner_id, name, instance FROM connections WHERE id = ?1",
            params![id.to_string()],
            row_to_connection,
        )
        .await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn create_contact(&self, contact: &Contact) -> Result<(Contact, bool), DatabaseError> {
        let inserted = self
            .execute(
                "create_contact",
                "INSERT INTO contacts (id, owner_id, phone, name, email, metadata, origin_id, profile_picture, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) ON CONFLICT (owner_id, phone) DO NOTHING",
                params![
                    contact.id.to_string(),
                    contact.owner_id.clone(),
                    contact.phone.clone(),
                    opt_text(contact.name.as_deref()),
                    opt_text(contact.email.as_deref()),
                    to_json(&contact.metadata)?,
                    opt_id(contact.origin_id),
                    opt_text(contact.profile_picture.as_deref()),
                    ts(contact.created_at),
                    ts(contact.updated_at),
                ],
            )
            .await?;

        let stored = self
            .find_contact_by_phone(&contact.owner_id, &contact.phone)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact.phone.clone(),
            })?;
        Ok((stored, inserted > 0))
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError> {
        self.fetch_one(
            "get_contact",
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id.to_string()],
            row_to_contact,
        )
        .await
    }

    async fn find_contact_by_phone(
        &self,
        owner_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        self.fetch_one(
            "find_contact_by_phone",
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE owner_id = ?1 AND phone = ?2"),
            params![owner_id, phone],
            row_to_contact,
        )
        .await
    }

    async fn update_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        let updated = self
            .execute(
                "update_contact",
                "UPDATE contacts SET name = ?1, email = ?2, metadata = ?3, origin_id = ?4, profile_picture = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    opt_text(contact.name.as_deref()),
                    opt_text(contact.email.as_deref()),
                    to_json(&contact.metadata)?,
                    opt_id(contact.origin_id),
                    opt_text(contact.profile_picture.as_deref()),
                    ts(Utc::now()),
                    contact.id.to_string(),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact.id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_contact_origin(&self, contact_id: Uuid, origin_id: Uuid) -> Result<(), DatabaseError> {
        let updated = self
            .execute(
                "set_contact_origin",
                "UPDATE contacts SET origin_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![origin_id.to_string(), ts(Utc::now()), contact_id.to_string()],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Tags ────────────────────────────────────────────────────────

    async fn ensure_tag(&self, owner_id: &str, name: &str, color: &str) -> Result<Tag, DatabaseError> {
        self.execute(
            "ensure_tag",
            "INSERT INTO tags (id, owner_id, name, color) VALUES (?1, ?2, ?3, ?4) ON CONFLICT (owner_id, name) DO NOTHING",
            params![Uuid::new_v4().to_string(), owner_id, name, color],
        )
        .await?;

        self.fetch_one(
            "ensure_tag",
            "SELECT id, owner_id, name, color FROM tags WHERE owner_id = ?1 AND name = ?2",
            params![owner_id, name],
            row_to_tag,
        )
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "tag".into(),
            id: name.to_string(),
        })
    }

    async fn assign_tag(&self, contact_id: Uuid, tag_id: Uuid) -> Result<bool, DatabaseError> {
        let inserted = self
            .execute(
                "assign_tag",
                "INSERT INTO contact_tags (contact_id, tag_id) VALUES (?1, ?2) ON CONFLICT (contact_id, tag_id) DO NOTHING",
                params![contact_id.to_string(), tag_id.to_string()],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn list_contact_tags(&self, contact_id: Uuid) -> Result<Vec<Tag>, DatabaseError> {
        self.fetch_all(
            "list_contact_tags",
            "SELECT t.id, t.owner_id, t.name, t.color FROM tags t JOIN contact_tags ct ON ct.tag_id = t.id WHERE ct.contact_id = ?1 ORDER BY t.name",
            params![contact_id.to_string()],
            row_to_tag,
        )
        .await
    }

    // ── Origins & deals ─────────────────────────────────────────────

    async fn create_origin(&self, origin: &Origin) -> Result<(), DatabaseError> {
        self.execute(
            "create_origin",
            "INSERT INTO origins (id, owner_id, name) VALUES (?1, ?2, ?3)",
            params![origin.id.to_string(), origin.owner_id.clone(), origin.name.clone()],
        )
        .await?;
        Ok(())
    }

    async fn get_origin(&self, id: Uuid) -> Result<Option<Origin>, DatabaseError> {
        self.fetch_one(
            "get_origin",
            "SELECT id, owner_id, name FROM origins WHERE id = ?1",
            params![id.to_string()],
            row_to_origin,
        )
        .await
    }

    async fn upsert_deal(&self, deal: &Deal) -> Result<(), DatabaseError> {
        self.execute(
            "upsert_deal",
            "INSERT INTO deals (id, contact_id, funnel_name, stage, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT (id) DO UPDATE SET funnel_name = excluded.funnel_name, stage = excluded.stage, updated_at = excluded.updated_at",
            params![
                deal.id.to_string(),
                deal.contact_id.to_string(),
                deal.funnel_name.clone(),
                deal.stage.clone(),
                ts(deal.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn latest_deal(&self, contact_id: Uuid) -> Result<Option<Deal>, DatabaseError> {
        self.fetch_one(
            "latest_deal",
            "SELECT id, contact_id, funnel_name, stage, updated_at FROM deals WHERE contact_id = ?1 ORDER BY updated_at DESC LIMIT 1",
            params![contact_id.to_string()],
            row_to_deal,
        )
        .await
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let (keywords, trigger_type, trigger_config) = match &rule.kind {
            RuleKind::Keyword { keywords } => (to_json(keywords)?, libsql::Value::Null, "{}".to_string()),
            RuleKind::Trigger { condition } => (
                "[]".to_string(),
                libsql::Value::Text(condition.trigger_type().as_str().to_string()),
                to_json(&condition.to_config_json())?,
            ),
        };
        let (relay_enabled, relay_url, relay_fields) = match &rule.relay {
            Some(relay) => (1i64, opt_text(Some(&relay.url)), to_json(&relay.custom_fields)?),
            None => (0i64, libsql::Value::Null, "{}".to_string()),
        };

        self.execute(
            "create_rule",
            "INSERT INTO rules (id, owner_id, name, active, kind, keywords, trigger_type, trigger_config, responses, relay_enabled, relay_url, relay_custom_fields, tags_to_add, origin_id, execution_count, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                rule.id.to_string(),
                rule.owner_id.clone(),
                rule.name.clone(),
                rule.active as i64,
                rule.kind.type_tag(),
                keywords,
                trigger_type,
                trigger_config,
                to_json(&rule.responses)?,
                relay_enabled,
                relay_url,
                relay_fields,
                to_json(&rule.tags_to_add)?,
                opt_id(rule.origin_id),
                rule.execution_count as i64,
                ts(rule.created_at),
                ts(rule.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, DatabaseError> {
        self.fetch_one(
            "get_rule",
            &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
            params![id.to_string()],
            row_to_rule,
        )
        .await
    }

    async fn list_keyword_rules(&self, owner_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        self.fetch_all(
            "list_keyword_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 AND active = 1 AND kind = 'keyword' ORDER BY name, id"
            ),
            params![owner_id],
            row_to_rule,
        )
        .await
    }

    async fn list_trigger_rules(
        &self,
        owner_id: &str,
        trigger_type: TriggerType,
    ) -> Result<Vec<Rule>, DatabaseError> {
        self.fetch_all(
            "list_trigger_rules",
            &format!(
                "SELECT {RULE_COLUMNS} FROM rules WHERE owner_id = ?1 AND active = 1 AND kind = 'trigger' AND trigger_type = ?2 ORDER BY name, id"
            ),
            params![owner_id, trigger_type.as_str()],
            row_to_rule,
        )
        .await
    }

    async fn increment_rule_execution(&self, id: Uuid) -> Result<u64, DatabaseError> {
        let count = self
            .fetch_one(
                "increment_rule_execution",
                "UPDATE rules SET execution_count = execution_count + 1, updated_at = ?1 WHERE id = ?2 RETURNING execution_count",
                params![ts(Utc::now()), id.to_string()],
                row_to_i64,
            )
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            })?;
        Ok(count.max(0) as u64)
    }

    // ── Webhooks ────────────────────────────────────────────────────

    async fn create_webhook(&self, webhook: &WebhookConfig) -> Result<(), DatabaseError> {
        let last_payload = match &webhook.last_payload {
            Some(p) => libsql::Value::Text(to_json(p)?),
            None => libsql::Value::Null,
        };
        self.execute(
            "create_webhook",
            "INSERT INTO webhooks (id, owner_id, name, active, connection_id, field_mappings, actions, total_received, last_payload, last_received_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                webhook.id.to_string(),
                webhook.owner_id.clone(),
                webhook.name.clone(),
                webhook.active as i64,
                opt_id(webhook.connection_id),
                to_json(&webhook.field_mappings)?,
                to_json(&webhook.actions)?,
                webhook.total_received as i64,
                last_payload,
                opt_ts(webhook.last_received_at),
                ts(webhook.created_at),
                ts(webhook.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid, owner_id: &str) -> Result<Option<WebhookConfig>, DatabaseError> {
        self.fetch_one(
            "get_webhook",
            &format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1 AND owner_id = ?2"),
            params![id.to_string(), owner_id],
            row_to_webhook,
        )
        .await
    }

    async fn record_webhook_receipt(
        &self,
        id: Uuid,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .execute(
                "record_webhook_receipt",
                "UPDATE webhooks SET total_received = total_received + 1, last_payload = ?1, last_received_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![to_json(payload)?, ts(received_at), id.to_string()],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "webhook".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Agent settings ──────────────────────────────────────────────

    async fn upsert_agent_setting(&self, setting: &AgentSetting) -> Result<(), DatabaseError> {
        self.execute(
            "upsert_agent_setting",
            "INSERT INTO agent_settings (contact_id, enabled, toggled_at, disabled_reason) VALUES (?1, ?2, ?3, ?4) ON CONFLICT (contact_id) DO UPDATE SET enabled = excluded.enabled, toggled_at = excluded.toggled_at, disabled_reason = excluded.disabled_reason",
            params![
                setting.contact_id.to_string(),
                setting.enabled as i64,
                ts(setting.toggled_at),
                opt_text(setting.disabled_reason.as_deref()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_agent_setting(&self, contact_id: Uuid) -> Result<Option<AgentSetting>, DatabaseError> {
        self.fetch_one(
            "get_agent_setting",
            "SELECT contact_id, enabled, toggled_at, disabled_reason FROM agent_settings WHERE contact_id = ?1",
            params![contact_id.to_string()],
            row_to_agent_setting,
        )
        .await
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn create_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError> {
        self.execute(
            "create_sequence",
            "INSERT INTO sequences (id, owner_id, name, active) VALUES (?1, ?2, ?3, ?4)",
            params![
                sequence.id.to_string(),
                sequence.owner_id.clone(),
                sequence.name.clone(),
                sequence.active as i64,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError> {
        self.fetch_one(
            "get_sequence",
            "SELECT id, owner_id, name, active FROM sequences WHERE id = ?1",
            params![id.to_string()],
            row_to_sequence,
        )
        .await
    }

    async fn enroll_in_sequence(&self, sequence_id: Uuid, contact_id: Uuid) -> Result<bool, DatabaseError> {
        let inserted = self
            .execute(
                "enroll_in_sequence",
                "INSERT INTO sequence_enrollments (sequence_id, contact_id, enrolled_at) VALUES (?1, ?2, ?3) ON CONFLICT (sequence_id, contact_id) DO NOTHING",
                params![sequence_id.to_string(), contact_id.to_string(), ts(Utc::now())],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn count_sequence_enrollments(&self, sequence_id: Uuid) -> Result<u64, DatabaseError> {
        let count = self
            .fetch_one(
                "count_sequence_enrollments",
                "SELECT COUNT(*) FROM sequence_enrollments WHERE sequence_id = ?1",
                params![sequence_id.to_string()],
                row_to_i64,
            )
            .await?
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    // ── API keys ────────────────────────────────────────────────────

    async fn create_api_key(&self, key: &str, owner_id: &str) -> Result<(), DatabaseError> {
        self.execute(
            "create_api_key",
            "INSERT INTO api_keys (key, owner_id) VALUES (?1, ?2)",
            params![key, owner_id],
        )
        .await?;
        Ok(())
    }

    async fn owner_for_api_key(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        self.fetch_one(
            "owner_for_api_key",
            "SELECT owner_id FROM api_keys WHERE key = ?1 AND active = 1",
            params![key],
            row_to_string,
        )
        .await
    }

    // ── Scheduled responses ─────────────────────────────────────────

    async fn insert_scheduled_responses(&self, rows: &[ScheduledResponse]) -> Result<(), DatabaseError> {
        // Last step first: if an insert fails, the armed first step is never
        // written and the leftover waiting rows stay inert.
        for row in rows.iter().rev() {
            let due: libsql::Value = match row.due_at_ms {
                Some(ms) => libsql::Value::Integer(ms),
                None => libsql::Value::Null,
            };
            self.execute(
                "insert_scheduled_responses",
                &format!(
                    "INSERT INTO scheduled_responses ({SCHEDULED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    row.id.to_string(),
                    row.execution_id.to_string(),
                    row.rule_id.to_string(),
                    row.contact_id.to_string(),
                    row.phone.clone(),
                    opt_text(row.instance.as_deref()),
                    row.step as i64,
                    row.order_index as i64,
                    row.kind.as_str(),
                    row.content.clone(),
                    row.delay_seconds as i64,
                    due,
                    row.status.as_str(),
                    opt_text(row.last_error.as_deref()),
                    opt_ts(row.finished_at),
                    ts(row.created_at),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn due_scheduled_responses(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError> {
        self.fetch_all(
            "due_scheduled_responses",
            &format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_responses WHERE status = 'pending' AND due_at_ms <= ?1 ORDER BY due_at_ms, step LIMIT ?2"
            ),
            params![now_ms, limit as i64],
            row_to_scheduled,
        )
        .await
    }

    async fn claim_scheduled_response(&self, id: Uuid, now_ms: i64) -> Result<bool, DatabaseError> {
        let claimed = self
            .execute(
                "claim_scheduled_response",
                "UPDATE scheduled_responses SET status = 'sending', claimed_at_ms = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), now_ms],
            )
            .await?;
        Ok(claimed == 1)
    }

    async fn finish_scheduled_response(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "finish_scheduled_response",
            "UPDATE scheduled_responses SET status = ?1, last_error = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), opt_text(error), ts(at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn arm_next_scheduled_response(
        &self,
        execution_id: Uuid,
        after_step: u32,
        now_ms: i64,
    ) -> Result<Option<Uuid>, DatabaseError> {
        self.fetch_one(
            "arm_next_scheduled_response",
            "UPDATE scheduled_responses SET status = 'pending', due_at_ms = ?3 + delay_seconds * 1000 \
             WHERE id = (SELECT id FROM scheduled_responses WHERE execution_id = ?1 AND step > ?2 AND status = 'waiting' ORDER BY step LIMIT 1) \
             RETURNING id",
            params![execution_id.to_string(), after_step as i64, now_ms],
            row_to_id,
        )
        .await
    }

    async fn list_scheduled_responses(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ScheduledResponse>, DatabaseError> {
        self.fetch_all(
            "list_scheduled_responses",
            &format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_responses WHERE execution_id = ?1 ORDER BY step"
            ),
            params![execution_id.to_string()],
            row_to_scheduled,
        )
        .await
    }

    async fn reset_stuck_scheduled_responses(&self, claimed_before_ms: i64) -> Result<usize, DatabaseError> {
        let count = self
            .execute(
                "reset_stuck_scheduled_responses",
                "UPDATE scheduled_responses SET status = 'pending', claimed_at_ms = NULL \
                 WHERE status = 'sending' AND (claimed_at_ms IS NULL OR claimed_at_ms <= ?1)",
                params![claimed_before_ms],
            )
            .await?;
        Ok(count as usize)
    }

    async fn arm_stalled_scheduled_responses(&self, now_ms: i64) -> Result<usize, DatabaseError> {
        let count = self
            .execute(
                "arm_stalled_scheduled_responses",
                "UPDATE scheduled_responses SET status = 'pending', due_at_ms = ?1 + delay_seconds * 1000 \
                 WHERE status = 'waiting' AND EXISTS ( \
                     SELECT 1 FROM scheduled_responses AS prev \
                     WHERE prev.execution_id = scheduled_responses.execution_id \
                       AND prev.step = scheduled_responses.step - 1 \
                       AND prev.status IN ('sent', 'failed', 'skipped'))",
                params![now_ms],
            )
            .await?;
        Ok(count as usize)
    }

    // ── Relay outbox ────────────────────────────────────────────────

    async fn enqueue_relay(&self, entry: &RelayOutboxEntry) -> Result<(), DatabaseError> {
        self.execute(
            "enqueue_relay",
            &format!(
                "INSERT INTO relay_outbox ({RELAY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                entry.id.to_string(),
                entry.rule_id.to_string(),
                entry.url.clone(),
                to_json(&entry.payload)?,
                entry.attempts as i64,
                entry.next_attempt_ms,
                entry.status.as_str(),
                opt_text(entry.last_error.as_deref()),
                ts(entry.created_at),
                opt_ts(entry.delivered_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn due_relays(&self, now_ms: i64, limit: usize) -> Result<Vec<RelayOutboxEntry>, DatabaseError> {
        self.fetch_all(
            "due_relays",
            &format!(
                "SELECT {RELAY_COLUMNS} FROM relay_outbox WHERE status = 'pending' AND next_attempt_ms <= ?1 ORDER BY next_attempt_ms LIMIT ?2"
            ),
            params![now_ms, limit as i64],
            row_to_relay,
        )
        .await
    }

    async fn get_relay(&self, id: Uuid) -> Result<Option<RelayOutboxEntry>, DatabaseError> {
        self.fetch_one(
            "get_relay",
            &format!("SELECT {RELAY_COLUMNS} FROM relay_outbox WHERE id = ?1"),
            params![id.to_string()],
            row_to_relay,
        )
        .await
    }

    async fn mark_relay_delivered(&self, id: Uuid, attempts: u32, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.execute(
            "mark_relay_delivered",
            "UPDATE relay_outbox SET status = 'delivered', attempts = ?1, delivered_at = ?2, last_error = NULL WHERE id = ?3",
            params![attempts as i64, ts(at), id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn reschedule_relay(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_ms: i64,
        error: &str,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "reschedule_relay",
            "UPDATE relay_outbox SET attempts = ?1, next_attempt_ms = ?2, last_error = ?3 WHERE id = ?4",
            params![attempts as i64, next_attempt_ms, error, id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn mark_relay_failed(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), DatabaseError> {
        self.execute(
            "mark_relay_failed",
            "UPDATE relay_outbox SET status = 'failed', attempts = ?1, last_error = ?2 WHERE id = ?3",
            params![attempts as i64, error, id.to_string()],
        )
        .await?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::automation::condition::Operator;
    use crate::automation::rule::{Keyword, MatchType, Response};
    use crate::webhooks::model::WebhookAction;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Contact & tag tests ─────────────────────────────────────────

    #[tokio::test]
    async fn create_contact_returns_existing_row_on_conflict() {
        let db = test_db().await;
        let first = Contact::new("acct", "5511999998888").with_name("Ana");
        let (stored, created) = db.create_contact(&first).await.unwrap();
        assert!(created);
        assert_eq!(stored.id, first.id);

        let racer = Contact::new("acct", "5511999998888").with_name("Other");
        let (stored, created) = db.create_contact(&racer).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.name.as_deref(), Some("Ana"));

        // Same phone, different owner is a different contact.
        let (_, created) = db.create_contact(&Contact::new("other", "5511999998888")).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn update_contact_persists_metadata() {
        let db = test_db().await;
        let (mut contact, _) = db.create_contact(&Contact::new("acct", "5511999998888")).await.unwrap();
        contact.email = Some("ana@example.com".into());
        contact.metadata.insert("plano".into(), json!("gold"));
        db.update_contact(&contact).await.unwrap();

        let stored = db.get_contact(contact.id).await.unwrap().unwrap();
        assert_eq!(stored.email.as_deref(), Some("ana@example.com"));
        assert_eq!(stored.metadata["plano"], "gold");

        let ghost = Contact::new("acct", "000");
        assert!(matches!(
            db.update_contact(&ghost).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn adding_a_tag_twice_assigns_once() {
        let db = test_db().await;
        let (contact, _) = db.create_contact(&Contact::new("acct", "5511999998888")).await.unwrap();

        let tag = db.ensure_tag("acct", "vip", "#000").await.unwrap();
        let again = db.ensure_tag("acct", "vip", "#fff").await.unwrap();
        assert_eq!(tag.id, again.id);
        assert_eq!(again.color, "#000");

        assert!(db.assign_tag(contact.id, tag.id).await.unwrap());
        assert!(!db.assign_tag(contact.id, tag.id).await.unwrap());
        assert_eq!(db.list_contact_tags(contact.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_tag_yields_one_tag() {
        let db = Arc::new(test_db().await);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                tokio::spawn(async move { db.ensure_tag("acct", "lead", "#111").await.unwrap().id })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn latest_deal_wins() {
        let db = test_db().await;
        let contact_id = Uuid::new_v4();
        let old = Deal {
            id: Uuid::new_v4(),
            contact_id,
            funnel_name: "vendas".into(),
            stage: "proposta".into(),
            updated_at: Utc::now() - chrono::Duration::hours(1),
        };
        let new = Deal {
            id: Uuid::new_v4(),
            stage: "ganho".into(),
            updated_at: Utc::now(),
            ..old.clone()
        };
        db.upsert_deal(&new).await.unwrap();
        db.upsert_deal(&old).await.unwrap();
        assert_eq!(db.latest_deal(contact_id).await.unwrap().unwrap().stage, "ganho");
    }

    // ── Rule tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn keyword_rule_roundtrip() {
        let db = test_db().await;
        let rule = Rule::keyword("acct", "greeting", vec![Keyword::new("oi", MatchType::Word)])
            .with_response(Response::text("Olá!", 0, 0))
            .with_tags(["lead"])
            .with_relay(RelayTarget::new("https://hooks.example/in"));
        db.create_rule(&rule).await.unwrap();

        let stored = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(stored.kind, rule.kind);
        assert_eq!(stored.responses, rule.responses);
        assert_eq!(stored.tags_to_add, vec!["lead"]);
        assert_eq!(stored.relay.unwrap().url, "https://hooks.example/in");
    }

    #[tokio::test]
    async fn trigger_rules_are_listed_by_type_and_activity() {
        let db = test_db().await;
        let field = Rule::trigger(
            "acct",
            "vip",
            TriggerCondition::CustomFieldChanged {
                field_key: "plano".into(),
                operator: Operator::Contains,
                value: json!("vip"),
            },
        );
        let won = Rule::trigger("acct", "won", TriggerCondition::DealWon);
        let mut paused = Rule::trigger("acct", "paused", TriggerCondition::DealWon);
        paused.active = false;
        for rule in [&field, &won, &paused] {
            db.create_rule(rule).await.unwrap();
        }

        let listed = db.list_trigger_rules("acct", TriggerType::DealWon).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, won.id);

        let listed = db
            .list_trigger_rules("acct", TriggerType::CustomFieldChanged)
            .await
            .unwrap();
        assert_eq!(listed[0].kind, field.kind);
        assert!(db.list_keyword_rules("acct").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_with_unknown_operator_is_skipped() {
        let db = test_db().await;
        let good = Rule::trigger(
            "acct",
            "good",
            TriggerCondition::CustomFieldChanged {
                field_key: "plano".into(),
                operator: Operator::Equals,
                value: json!("gold"),
            },
        );
        db.create_rule(&good).await.unwrap();
        db.conn()
            .execute(
                "INSERT INTO rules (id, owner_id, name, kind, trigger_type, trigger_config, created_at, updated_at) VALUES (?1, 'acct', 'bad', 'trigger', 'custom_field_changed', ?2, ?3, ?3)",
                params![
                    Uuid::new_v4().to_string(),
                    json!({ "field_key": "plano", "operator": "regex", "value": "g.*" }).to_string(),
                    ts(Utc::now()),
                ],
            )
            .await
            .unwrap();

        let listed = db
            .list_trigger_rules("acct", TriggerType::CustomFieldChanged)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "good");
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let db = Arc::new(test_db().await);
        let rule = Rule::trigger("acct", "won", TriggerCondition::DealWon);
        db.create_rule(&rule).await.unwrap();
        let rule_id = rule.id;

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let db = Arc::clone(&db);
                tokio::spawn(async move { db.increment_rule_execution(rule_id).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(db.get_rule(rule_id).await.unwrap().unwrap().execution_count, 20);
        assert!(db.increment_rule_execution(Uuid::new_v4()).await.is_err());
    }

    // ── Webhook, agent, sequence and key tests ──────────────────────

    #[tokio::test]
    async fn webhook_receipt_updates_stats() {
        let db = test_db().await;
        let webhook = WebhookConfig::new("acct", "forms")
            .with_mapping("phone", "$.data.phone")
            .with_action(WebhookAction::AddTag { tag: "lead".into() });
        db.create_webhook(&webhook).await.unwrap();

        assert!(db.get_webhook(webhook.id, "someone-else").await.unwrap().is_none());

        db.record_webhook_receipt(webhook.id, &json!({ "a": 1 }), Utc::now())
            .await
            .unwrap();
        db.record_webhook_receipt(webhook.id, &json!({ "a": 2 }), Utc::now())
            .await
            .unwrap();

        let stored = db.get_webhook(webhook.id, "acct").await.unwrap().unwrap();
        assert_eq!(stored.total_received, 2);
        assert_eq!(stored.last_payload, Some(json!({ "a": 2 })));
        assert!(stored.last_received_at.is_some());
        assert_eq!(stored.field_mappings, webhook.field_mappings);
        assert_eq!(stored.actions, webhook.actions);
    }

    #[tokio::test]
    async fn agent_setting_upserts() {
        let db = test_db().await;
        let contact_id = Uuid::new_v4();
        db.upsert_agent_setting(&AgentSetting {
            contact_id,
            enabled: false,
            toggled_at: Utc::now(),
            disabled_reason: Some("disabled_by_webhook".into()),
        })
        .await
        .unwrap();
        db.upsert_agent_setting(&AgentSetting {
            contact_id,
            enabled: true,
            toggled_at: Utc::now(),
            disabled_reason: None,
        })
        .await
        .unwrap();
        let stored = db.get_agent_setting(contact_id).await.unwrap().unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.disabled_reason, None);
    }

    #[tokio::test]
    async fn enrollment_is_idempotent() {
        let db = test_db().await;
        let sequence = Sequence {
            id: Uuid::new_v4(),
            owner_id: "acct".into(),
            name: "onboarding".into(),
            active: true,
        };
        db.create_sequence(&sequence).await.unwrap();
        let contact_id = Uuid::new_v4();
        assert!(db.enroll_in_sequence(sequence.id, contact_id).await.unwrap());
        assert!(!db.enroll_in_sequence(sequence.id, contact_id).await.unwrap());
        assert_eq!(db.count_sequence_enrollments(sequence.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn api_key_lookup() {
        let db = test_db().await;
        db.create_api_key("k-123", "acct").await.unwrap();
        assert_eq!(db.owner_for_api_key("k-123").await.unwrap().as_deref(), Some("acct"));
        assert_eq!(db.owner_for_api_key("nope").await.unwrap(), None);
        assert!(matches!(
            db.create_api_key("k-123", "other").await,
            Err(DatabaseError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn not_null_violation_is_a_query_error() {
        let db = test_db().await;
        let result = db
            .execute(
                "raw_insert",
                "INSERT INTO api_keys (key, owner_id) VALUES (?1, NULL)",
                params!["k-null"],
            )
            .await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));
    }

    #[tokio::test]
    async fn local_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autoflow.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_api_key("k", "acct").await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.owner_for_api_key("k").await.unwrap().as_deref(), Some("acct"));
    }
}
