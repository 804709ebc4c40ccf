//! Durable pending-event queue
//!
//! Provides append/drain/delete operations over the SQLite queue. A drain
//! returns an immutable snapshot grouped into batches; delivery later
//! deletes exactly the sequence ids captured in each batch, so events
//! appended during the network round trip are never lost to a blanket
//! delete.

use crate::error::Result;
use crate::events::{Category, Event, EventEnvelope, EventPayload, Gender, UserFields};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// An event together with the sequence id assigned on insert
#[derive(Debug, Clone)]
pub struct PendingRecord {
    /// Monotonically increasing local id (SQLite rowid)
    pub sequence_id: i64,
    pub event: Event,
}

/// Immutable snapshot of the pending records for one
/// (category, app key, secret) grouping, in sequence order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub category: Category,
    pub app_key: String,
    pub secret: String,
    pub records: Vec<PendingRecord>,
}

impl Batch {
    /// The exact ids to delete once this batch is confirmed delivered
    pub fn sequence_ids(&self) -> Vec<i64> {
        self.records.iter().map(|r| r.sequence_id).collect()
    }

    /// Events in sequence order, for serialization
    pub fn events(&self) -> Vec<&Event> {
        self.records.iter().map(|r| &r.event).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Queue handle; a single mutex-guarded connection
pub struct EventStore {
    conn: Mutex<Connection>,
    /// Maximum stored events; 0 = unlimited
    max_events: AtomicU32,
}

impl EventStore {
    /// Open or create the queue database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode so the caller-path insert and the delivery-path read
        // contend as little as possible
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_events: AtomicU32::new(0),
        })
    }

    /// Open an in-memory queue (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_events: AtomicU32::new(0),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Cap local storage at `max` events; 0 = unlimited
    pub fn set_max_events(&self, max: u32) {
        self.max_events.store(max, Ordering::Relaxed);
    }

    /// Insert one event, returning its sequence id.
    ///
    /// Returns `Ok(None)` when the storage cap is reached: the event is
    /// dropped rather than surfaced as an error, so a full queue can never
    /// push a failure into the host application.
    pub fn append(&self, app_key: &str, secret: &str, event: &Event) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();

        let max = self.max_events.load(Ordering::Relaxed);
        if max > 0 {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM pending_events", [], |r| r.get(0))?;
            if count >= i64::from(max) {
                tracing::debug!(
                    max,
                    category = %event.category(),
                    "event storage full, dropping event"
                );
                return Ok(None);
            }
        }

        let mut value: Option<f32> = None;
        let mut currency: Option<&str> = None;
        let mut amount: Option<i64> = None;
        let mut message: Option<&str> = None;
        let mut user: Option<&UserFields> = None;
        match &event.payload {
            EventPayload::Design { value: v } => value = Some(*v),
            EventPayload::Business {
                currency: c,
                amount: a,
            } => {
                currency = Some(c);
                amount = Some(*a);
            }
            EventPayload::User(fields) => user = Some(fields),
            EventPayload::Quality { message: m } => message = Some(m),
        }

        let envelope = &event.envelope;
        conn.execute(
            r#"
            INSERT INTO pending_events
                (category, app_key, secret,
                 user_id, session_id, build, event_id, area, x, y, z,
                 value, currency, amount,
                 gender, birth_year, friend_count,
                 platform, device, os_major, os_minor, sdk_version,
                 install_publisher, install_site, install_campaign,
                 install_ad, install_keyword, android_id,
                 message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                    ?25, ?26, ?27, ?28, ?29)
            "#,
            params![
                event.category().as_str(),
                app_key,
                secret,
                envelope.user_id,
                envelope.session_id,
                envelope.build,
                envelope.event_id,
                envelope.area,
                envelope.x,
                envelope.y,
                envelope.z,
                value,
                currency,
                amount,
                user.map(|u| u.gender.as_str()),
                user.map(|u| u.birth_year),
                user.map(|u| u.friend_count),
                user.and_then(|u| u.platform.as_deref()),
                user.and_then(|u| u.device.as_deref()),
                user.and_then(|u| u.os_major.as_deref()),
                user.and_then(|u| u.os_minor.as_deref()),
                user.and_then(|u| u.sdk_version.as_deref()),
                user.and_then(|u| u.install_publisher.as_deref()),
                user.and_then(|u| u.install_site.as_deref()),
                user.and_then(|u| u.install_campaign.as_deref()),
                user.and_then(|u| u.install_ad.as_deref()),
                user.and_then(|u| u.install_keyword.as_deref()),
                user.and_then(|u| u.android_id.as_deref()),
                message,
            ],
        )?;

        Ok(Some(conn.last_insert_rowid()))
    }

    /// Read every pending record, grouped into batches, without deleting.
    ///
    /// Safe under concurrent `append`: the snapshot is taken under the
    /// connection lock, and later appends simply miss this drain and wait
    /// for the next one.
    pub fn drain(&self) -> Result<Vec<Batch>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare("SELECT * FROM pending_events ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_record)?;

        let mut groups: BTreeMap<(String, String, String), Batch> = BTreeMap::new();
        for row in rows {
            let (sequence_id, app_key, secret, event) = row?;
            let Some(event) = event else {
                // Unreachable through append; guard against external writes
                tracing::warn!(sequence_id, "skipping row with unknown category tag");
                continue;
            };
            let category = event.category();
            let key = (
                category.as_str().to_string(),
                app_key.clone(),
                secret.clone(),
            );
            groups
                .entry(key)
                .or_insert_with(|| Batch {
                    category,
                    app_key,
                    secret,
                    records: Vec::new(),
                })
                .records
                .push(PendingRecord { sequence_id, event });
        }

        Ok(groups.into_values().collect())
    }

    /// Delete exactly the given sequence ids. Unknown ids are a no-op.
    pub fn delete_records(&self, sequence_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM pending_events WHERE id = ?1")?;
            for id in sequence_ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Move the given records into the dead-letter table with the HTTP
    /// status that condemned them. Unknown ids are a no-op.
    pub fn dead_letter_records(&self, sequence_ids: &[i64], http_status: u16) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut moved = 0;
        {
            let mut select = tx.prepare("SELECT * FROM pending_events WHERE id = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO dead_events
                     (pending_id, category, app_key, http_status, dead_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut delete = tx.prepare("DELETE FROM pending_events WHERE id = ?1")?;

            for id in sequence_ids {
                let record = select
                    .query_row(params![id], Self::row_to_record)
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some((sequence_id, app_key, _secret, Some(event))) = record else {
                    continue;
                };

                let payload = serde_json::to_string(&event)?;
                insert.execute(params![
                    sequence_id,
                    event.category().as_str(),
                    app_key,
                    http_status,
                    Utc::now().to_rfc3339(),
                    payload,
                ])?;
                delete.execute(params![sequence_id])?;
                moved += 1;
            }
        }
        tx.commit()?;
        Ok(moved)
    }

    /// Unconditionally empty the pending queue
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM pending_events", [])?;
        Ok(())
    }

    /// Number of pending events
    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_events", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Number of dead-lettered events
    pub fn dead_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_events", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<(i64, String, String, Option<Event>)> {
        let sequence_id: i64 = row.get("id")?;
        let category_str: String = row.get("category")?;
        let app_key: String = row.get("app_key")?;
        let secret: String = row.get("secret")?;

        let envelope = EventEnvelope {
            user_id: row.get("user_id")?,
            session_id: row.get("session_id")?,
            build: row.get("build")?,
            event_id: row.get("event_id")?,
            area: row.get("area")?,
            x: row.get::<_, f64>("x")? as f32,
            y: row.get::<_, f64>("y")? as f32,
            z: row.get::<_, f64>("z")? as f32,
        };

        let payload = match category_str.parse::<Category>() {
            Ok(Category::Design) => Some(EventPayload::Design {
                value: row.get::<_, Option<f64>>("value")?.unwrap_or(0.0) as f32,
            }),
            Ok(Category::Business) => Some(EventPayload::Business {
                currency: row.get::<_, Option<String>>("currency")?.unwrap_or_default(),
                amount: row.get::<_, Option<i64>>("amount")?.unwrap_or(0),
            }),
            Ok(Category::User) => {
                let gender = row
                    .get::<_, Option<String>>("gender")?
                    .and_then(|g| g.parse::<Gender>().ok())
                    .unwrap_or_default();
                Some(EventPayload::User(UserFields {
                    gender,
                    birth_year: row.get::<_, Option<i32>>("birth_year")?.unwrap_or(0),
                    friend_count: row.get::<_, Option<i32>>("friend_count")?.unwrap_or(0),
                    platform: row.get("platform")?,
                    device: row.get("device")?,
                    os_major: row.get("os_major")?,
                    os_minor: row.get("os_minor")?,
                    sdk_version: row.get("sdk_version")?,
                    install_publisher: row.get("install_publisher")?,
                    install_site: row.get("install_site")?,
                    install_campaign: row.get("install_campaign")?,
                    install_ad: row.get("install_ad")?,
                    install_keyword: row.get("install_keyword")?,
                    android_id: row.get("android_id")?,
                }))
            }
            Ok(Category::Quality) => Some(EventPayload::Quality {
                message: row.get::<_, Option<String>>("message")?.unwrap_or_default(),
            }),
            Err(_) => None,
        };

        Ok((
            sequence_id,
            app_key,
            secret,
            payload.map(|payload| Event { envelope, payload }),
        ))
    }
}
