//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding generated posts
//! (the dedup history) and catalog items with their precomputed embeddings.
//!
//! **Write rules:**
//! - Every post write goes through [`Storage::save_post_checked`], which
//!   re-runs the hard dedup window inside a `BEGIN IMMEDIATE` transaction.
//! - Readers that must never write use [`Storage::open_readonly`].

mod migrations;

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use postforge_shared::{CatalogItem, Channel, Post, PostId, PostStatus, PostforgeError, Result};
use tokio::sync::Mutex;

/// Column list shared by every post query, in [`row_to_post`] order.
const POST_COLUMNS: &str = "id, external_id, date_for, created_at, channel, post_type, \
     content_tone, topic, topic_hash, problem_identified, caption, image_prompt, \
     carousel_slides_json, needs_music, posting_time, cta, hashtags_json, \
     selected_product_id, formatted_content_json, status, user_feedback, possibly_duplicate";

/// Column list shared by every catalog query, in [`row_to_catalog_item`] order.
const CATALOG_COLUMNS: &str = "id, name, sku, category, description, cost, shipping_cost, \
     margin, stock, active, specs_json, embedding_json";

/// An existing post that blocks a save under the hard window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashConflict {
    pub post_id: PostId,
    pub date_for: NaiveDate,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writers sharing this handle; `BEGIN IMMEDIATE` covers other processes.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PostforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PostforgeError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PostforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Post writes
    // -----------------------------------------------------------------------

    /// Persist a post unless its `topic_hash` collides inside the hard window.
    ///
    /// Upserts by `external_id` when one is set, otherwise by `id`. The
    /// conflict query and the write run in one `BEGIN IMMEDIATE` transaction,
    /// so a concurrent writer either sees this row or is blocked until it
    /// commits. Returns the post as stored.
    pub async fn save_post_checked(&self, post: &Post, hard_window_days: i64) -> Result<Post> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        self.conn
            .execute("BEGIN IMMEDIATE", params![])
            .await
            .map_err(storage_err)?;

        match self.save_post_in_tx(post, hard_window_days).await {
            Ok(stored) => {
                self.conn
                    .execute("COMMIT", params![])
                    .await
                    .map_err(storage_err)?;
                tracing::debug!(post_id = %stored.id, topic_hash = %stored.topic_hash, "post saved");
                Ok(stored)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute("ROLLBACK", params![]).await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn save_post_in_tx(&self, post: &Post, hard_window_days: i64) -> Result<Post> {
        // An external_id match pins the row id so the upsert lands on it.
        let target_id = match &post.external_id {
            Some(ext) => match self.post_id_by_external_id(ext).await? {
                Some(existing) => existing,
                None => post.id.clone(),
            },
            None => post.id.clone(),
        };

        if let Some(conflict) = self
            .find_hash_conflict(&post.topic_hash, post.date_for, hard_window_days, Some(&target_id))
            .await?
        {
            return Err(PostforgeError::DuplicateTopic {
                topic_hash: post.topic_hash.clone(),
                existing_id: conflict.post_id.to_string(),
                existing_date: conflict.date_for.to_string(),
            });
        }

        let stored = Post {
            id: target_id,
            ..post.clone()
        };
        self.upsert_post_row(&stored).await?;
        Ok(stored)
    }

    async fn upsert_post_row(&self, post: &Post) -> Result<()> {
        let carousel = to_json(&post.carousel_slides)?;
        let hashtags = to_json(&post.hashtags)?;
        let formatted = to_json(&post.formatted_content)?;
        let sql = format!(
            "INSERT INTO posts ({POST_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22)
             ON CONFLICT(id) DO UPDATE SET
               external_id = excluded.external_id,
               date_for = excluded.date_for,
               channel = excluded.channel,
               post_type = excluded.post_type,
               content_tone = excluded.content_tone,
               topic = excluded.topic,
               topic_hash = excluded.topic_hash,
               problem_identified = excluded.problem_identified,
               caption = excluded.caption,
               image_prompt = excluded.image_prompt,
               carousel_slides_json = excluded.carousel_slides_json,
               needs_music = excluded.needs_music,
               posting_time = excluded.posting_time,
               cta = excluded.cta,
               hashtags_json = excluded.hashtags_json,
               selected_product_id = excluded.selected_product_id,
               formatted_content_json = excluded.formatted_content_json,
               status = excluded.status,
               user_feedback = excluded.user_feedback,
               possibly_duplicate = excluded.possibly_duplicate"
        );
        self.conn
            .execute(
                &sql,
                params![
                    post.id.to_string(),
                    post.external_id.as_deref(),
                    post.date_for.to_string(),
                    format_timestamp(&post.created_at),
                    post.channel.as_str(),
                    post.post_type.as_str(),
                    post.content_tone.as_str(),
                    post.topic.as_str(),
                    post.topic_hash.as_str(),
                    post.problem_identified.as_str(),
                    post.caption.as_str(),
                    post.image_prompt.as_str(),
                    carousel,
                    i64::from(post.needs_music),
                    post.posting_time.as_deref(),
                    post.cta.as_deref(),
                    hashtags,
                    post.selected_product_id.as_deref(),
                    formatted,
                    post.status.as_str(),
                    post.user_feedback.as_deref(),
                    i64::from(post.possibly_duplicate),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Update the review status and, when given, the feedback of a post.
    pub async fn update_post_status(
        &self,
        id: &PostId,
        status: PostStatus,
        feedback: Option<&str>,
    ) -> Result<Post> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let changed = self
            .conn
            .execute(
                "UPDATE posts SET status = ?1, user_feedback = COALESCE(?2, user_feedback)
                 WHERE id = ?3",
                params![status.as_str(), feedback, id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(PostforgeError::NotFound(format!("post {id}")));
        }

        self.get_post(id)
            .await?
            .ok_or_else(|| PostforgeError::NotFound(format!("post {id}")))
    }

    // -----------------------------------------------------------------------
    // Post reads
    // -----------------------------------------------------------------------

    /// Get a post by ID.
    pub async fn get_post(&self, id: &PostId) -> Result<Option<Post>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id.to_string()])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_post(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Get a post by its caller-supplied idempotency key.
    pub async fn get_post_by_external_id(&self, external_id: &str) -> Result<Option<Post>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE external_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![external_id])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_post(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn post_id_by_external_id(&self, external_id: &str) -> Result<Option<PostId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM posts WHERE external_id = ?1",
                params![external_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row.get(0).map_err(storage_err)?;
                Ok(Some(parse_post_id(&id)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Posts with `date_for` in `[from, to]`, newest generation first.
    pub async fn posts_in_date_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<Post>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE date_for >= ?1 AND date_for <= ?2
             ORDER BY created_at DESC
             LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![from.to_string(), to.to_string(), limit])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_post(&row)?);
        }
        Ok(results)
    }

    /// First post sharing `topic_hash` whose `date_for` lies within
    /// `date ± window_days` (inclusive), ignoring `exclude_id`.
    pub async fn find_hash_conflict(
        &self,
        topic_hash: &str,
        date: NaiveDate,
        window_days: i64,
        exclude_id: Option<&PostId>,
    ) -> Result<Option<HashConflict>> {
        let from = date - Duration::days(window_days);
        let to = date + Duration::days(window_days);
        let exclude = exclude_id.map(|id| id.to_string());

        let mut rows = self
            .conn
            .query(
                "SELECT id, date_for FROM posts
                 WHERE topic_hash = ?1 AND date_for >= ?2 AND date_for <= ?3
                   AND (?4 IS NULL OR id != ?4)
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![topic_hash, from.to_string(), to.to_string(), exclude],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };
        let post_id: String = row.get(0).map_err(storage_err)?;
        let date_for: String = row.get(1).map_err(storage_err)?;
        Ok(Some(HashConflict {
            post_id: parse_post_id(&post_id)?,
            date_for: parse_date(&date_for)?,
        }))
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Insert or replace a catalog item by ID.
    pub async fn upsert_catalog_item(&self, item: &CatalogItem) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let specs = to_json(&item.specs)?;
        let embedding = item.embedding.as_ref().map(to_json).transpose()?;
        let now = format_timestamp(&Utc::now());
        let sql = format!(
            "INSERT INTO catalog_items ({CATALOG_COLUMNS}, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               sku = excluded.sku,
               category = excluded.category,
               description = excluded.description,
               cost = excluded.cost,
               shipping_cost = excluded.shipping_cost,
               margin = excluded.margin,
               stock = excluded.stock,
               active = excluded.active,
               specs_json = excluded.specs_json,
               embedding_json = COALESCE(excluded.embedding_json, catalog_items.embedding_json),
               updated_at = excluded.updated_at"
        );
        self.conn
            .execute(
                &sql,
                params![
                    item.id.as_str(),
                    item.name.as_str(),
                    item.sku.as_str(),
                    item.category.as_str(),
                    item.description.as_str(),
                    item.cost,
                    item.shipping_cost,
                    item.margin,
                    item.stock,
                    i64::from(item.active),
                    specs,
                    embedding,
                    now,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a catalog item by ID.
    pub async fn get_catalog_item(&self, id: &str) -> Result<Option<CatalogItem>> {
        let sql = format!("SELECT {CATALOG_COLUMNS} FROM catalog_items WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_catalog_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Active items that carry an embedding, optionally restricted to
    /// categories containing `category` (case-insensitive).
    pub async fn list_embedded_items(&self, category: Option<&str>) -> Result<Vec<CatalogItem>> {
        let pattern = category.map(like_pattern);
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM catalog_items
             WHERE active = 1 AND embedding_json IS NOT NULL
               AND (?1 IS NULL OR lower(category) LIKE ?1)
             ORDER BY id"
        );
        let mut rows = self
            .conn
            .query(&sql, params![pattern])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_catalog_item(&row)?);
        }
        Ok(results)
    }

    /// Case-insensitive substring search over active items' name, SKU and description.
    pub async fn keyword_search_items(
        &self,
        query: &str,
        category: Option<&str>,
        limit: u32,
    ) -> Result<Vec<CatalogItem>> {
        let needle = like_pattern(query);
        let category = category.map(like_pattern);
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM catalog_items
             WHERE active = 1
               AND (lower(name) LIKE ?1 OR lower(sku) LIKE ?1 OR lower(description) LIKE ?1)
               AND (?2 IS NULL OR lower(category) LIKE ?2)
             ORDER BY stock DESC, name
             LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![needle, category, limit])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_catalog_item(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn storage_err(e: impl std::fmt::Display) -> PostforgeError {
    PostforgeError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| PostforgeError::Storage(format!("encode json: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| PostforgeError::Storage(format!("invalid {column}: {e}")))
}

/// RFC 3339 with fixed microsecond precision so text ordering matches time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn like_pattern(text: &str) -> String {
    format!("%{}%", text.trim().to_lowercase())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| PostforgeError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_post_id(s: &str) -> Result<PostId> {
    s.parse()
        .map_err(|e| PostforgeError::Storage(format!("invalid post id '{s}': {e}")))
}

/// Convert a database row to a [`Post`].
fn row_to_post(row: &libsql::Row) -> Result<Post> {
    let id: String = row.get(0).map_err(storage_err)?;
    let date_for: String = row.get(2).map_err(storage_err)?;
    let created_at: String = row.get(3).map_err(storage_err)?;
    let channel: String = row.get(4).map_err(storage_err)?;
    let carousel: String = row.get(12).map_err(storage_err)?;
    let hashtags: String = row.get(16).map_err(storage_err)?;
    let formatted: String = row.get(18).map_err(storage_err)?;
    let status: String = row.get(19).map_err(storage_err)?;

    Ok(Post {
        id: parse_post_id(&id)?,
        external_id: row.get::<String>(1).ok(),
        date_for: parse_date(&date_for)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PostforgeError::Storage(format!("invalid timestamp: {e}")))?,
        channel: channel
            .parse::<Channel>()
            .map_err(PostforgeError::Storage)?,
        post_type: row.get(5).map_err(storage_err)?,
        content_tone: row.get(6).map_err(storage_err)?,
        topic: row.get(7).map_err(storage_err)?,
        topic_hash: row.get(8).map_err(storage_err)?,
        problem_identified: row.get(9).map_err(storage_err)?,
        caption: row.get(10).map_err(storage_err)?,
        image_prompt: row.get(11).map_err(storage_err)?,
        carousel_slides: from_json("carousel_slides_json", &carousel)?,
        needs_music: row.get::<i64>(13).map_err(storage_err)? != 0,
        posting_time: row.get::<String>(14).ok(),
        cta: row.get::<String>(15).ok(),
        hashtags: from_json("hashtags_json", &hashtags)?,
        selected_product_id: row.get::<String>(17).ok(),
        formatted_content: from_json("formatted_content_json", &formatted)?,
        status: status
            .parse::<PostStatus>()
            .map_err(PostforgeError::Storage)?,
        user_feedback: row.get::<String>(20).ok(),
        possibly_duplicate: row.get::<i64>(21).map_err(storage_err)? != 0,
    })
}

/// Convert a database row to a [`CatalogItem`].
fn row_to_catalog_item(row: &libsql::Row) -> Result<CatalogItem> {
    let specs: String = row.get(10).map_err(storage_err)?;
    let embedding = match row.get::<String>(11).ok() {
        Some(raw) => Some(from_json::<Vec<f32>>("embedding_json", &raw)?),
        None => None,
    };

    Ok(CatalogItem {
        id: row.get(0).map_err(storage_err)?,
        name: row.get(1).map_err(storage_err)?,
        sku: row.get(2).map_err(storage_err)?,
        category: row.get(3).map_err(storage_err)?,
        description: row.get(4).map_err(storage_err)?,
        cost: row.get(5).map_err(storage_err)?,
        shipping_cost: row.get(6).map_err(storage_err)?,
        margin: row.get::<f64>(7).ok(),
        stock: row.get(8).map_err(storage_err)?,
        active: row.get::<i64>(9).map_err(storage_err)? != 0,
        specs: from_json("specs_json", &specs)?,
        embedding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
    }

    fn sample_post(topic_hash: &str, date_for: &str) -> Post {
        Post {
            id: PostId::new(),
            external_id: None,
            date_for: date(date_for),
            created_at: Utc::now(),
            channel: Channel::FbPost,
            post_type: "Infografías".into(),
            content_tone: "Educativo".into(),
            topic: format!("topic {topic_hash}"),
            topic_hash: topic_hash.into(),
            problem_identified: "riego ineficiente".into(),
            caption: "caption".into(),
            image_prompt: "prompt".into(),
            carousel_slides: vec!["slide 1".into(), "slide 2".into()],
            needs_music: false,
            posting_time: Some("19:00".into()),
            cta: None,
            hashtags: vec!["#riego".into()],
            selected_product_id: Some("item-1".into()),
            formatted_content: serde_json::json!({"products": [{"id": "item-1", "category": "riego"}]}),
            status: PostStatus::Draft,
            user_feedback: None,
            possibly_duplicate: false,
        }
    }

    fn sample_item(id: &str, category: &str, embedding: Option<Vec<f32>>) -> CatalogItem {
        CatalogItem {
            id: id.into(),
            name: format!("Kit {id}"),
            sku: format!("SKU-{id}"),
            category: category.into(),
            description: "Cintilla de goteo calibre 8000".into(),
            cost: 100.0,
            shipping_cost: 5.0,
            margin: None,
            stock: 3,
            active: true,
            specs: vec!["16mm".into()],
            embedding,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("pf_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn post_roundtrip() {
        let storage = test_storage().await;
        let post = sample_post("h1", "2026-03-10");
        let saved = storage.save_post_checked(&post, 10).await.expect("save");

        let found = storage
            .get_post(&saved.id)
            .await
            .expect("get")
            .expect("post exists");
        assert_eq!(found.topic_hash, "h1");
        assert_eq!(found.carousel_slides.len(), 2);
        assert_eq!(found.channel, Channel::FbPost);
        assert_eq!(found.posting_time.as_deref(), Some("19:00"));
        assert_eq!(found.formatted_content["products"][0]["id"], "item-1");
    }

    #[tokio::test]
    async fn hard_window_rejects_within_and_accepts_outside() {
        let storage = test_storage().await;
        let first = storage
            .save_post_checked(&sample_post("same", "2026-03-01"), 10)
            .await
            .expect("first save");

        let err = storage
            .save_post_checked(&sample_post("same", "2026-03-06"), 10)
            .await
            .expect_err("5 days apart must conflict");
        match err {
            PostforgeError::DuplicateTopic { existing_id, existing_date, .. } => {
                assert_eq!(existing_id, first.id.to_string());
                assert_eq!(existing_date, "2026-03-01");
            }
            other => panic!("unexpected error: {other}"),
        }

        storage
            .save_post_checked(&sample_post("same", "2026-03-12"), 10)
            .await
            .expect("11 days apart is accepted");
    }

    #[tokio::test]
    async fn unreadable_history_row_is_an_error() {
        let storage = test_storage().await;
        let stored = storage
            .save_post_checked(&sample_post("broken", "2026-03-01"), 10)
            .await
            .expect("save");
        storage
            .conn
            .execute(
                "UPDATE posts SET id = 'not-a-uuid' WHERE id = ?1",
                params![stored.id.to_string()],
            )
            .await
            .expect("corrupt row");

        assert!(matches!(
            storage.find_hash_conflict("broken", date("2026-03-02"), 10, None).await,
            Err(PostforgeError::Storage(_))
        ));
        assert!(matches!(
            storage
                .posts_in_date_range(date("2026-02-01"), date("2026-03-31"), 10)
                .await,
            Err(PostforgeError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn hard_window_is_inclusive() {
        let storage = test_storage().await;
        storage
            .save_post_checked(&sample_post("edge", "2026-03-01"), 10)
            .await
            .expect("first save");
        assert!(
            storage
                .save_post_checked(&sample_post("edge", "2026-03-11"), 10)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn external_id_upserts_same_row() {
        let storage = test_storage().await;
        let mut post = sample_post("ext", "2026-03-10");
        post.external_id = Some("job-42".into());
        let first = storage.save_post_checked(&post, 10).await.expect("save");

        // Same key, fresh id and the same hash: replaces rather than conflicting.
        let mut again = sample_post("ext", "2026-03-10");
        again.external_id = Some("job-42".into());
        again.caption = "edited".into();
        let second = storage.save_post_checked(&again, 10).await.expect("upsert");

        assert_eq!(first.id, second.id);
        let found = storage
            .get_post_by_external_id("job-42")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(found.caption, "edited");
    }

    #[tokio::test]
    async fn failed_save_leaves_no_row() {
        let storage = test_storage().await;
        storage
            .save_post_checked(&sample_post("dup", "2026-03-10"), 10)
            .await
            .expect("save");
        let rejected = sample_post("dup", "2026-03-11");
        assert!(storage.save_post_checked(&rejected, 10).await.is_err());
        assert!(storage.get_post(&rejected.id).await.expect("get").is_none());

        // Connection is usable after the rollback.
        storage
            .save_post_checked(&sample_post("other", "2026-03-11"), 10)
            .await
            .expect("save after rollback");
    }

    #[tokio::test]
    async fn range_orders_by_created_at_desc() {
        let storage = test_storage().await;
        let mut older = sample_post("a", "2026-03-10");
        older.created_at = Utc::now() - Duration::hours(2);
        let mut newer = sample_post("b", "2026-03-01");
        newer.created_at = Utc::now();
        storage.save_post_checked(&older, 10).await.expect("save older");
        storage.save_post_checked(&newer, 10).await.expect("save newer");
        storage
            .save_post_checked(&sample_post("c", "2026-01-01"), 10)
            .await
            .expect("save out of range");

        let posts = storage
            .posts_in_date_range(date("2026-02-28"), date("2026-03-10"), 20)
            .await
            .expect("range");
        let hashes: Vec<&str> = posts.iter().map(|p| p.topic_hash.as_str()).collect();
        assert_eq!(hashes, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn status_update() {
        let storage = test_storage().await;
        let saved = storage
            .save_post_checked(&sample_post("s", "2026-03-10"), 10)
            .await
            .expect("save");

        let updated = storage
            .update_post_status(&saved.id, PostStatus::Approved, Some("buen post"))
            .await
            .expect("update");
        assert_eq!(updated.status, PostStatus::Approved);
        assert_eq!(updated.user_feedback.as_deref(), Some("buen post"));

        let missing = storage
            .update_post_status(&PostId::new(), PostStatus::Rejected, None)
            .await;
        assert!(matches!(missing, Err(PostforgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn catalog_queries() {
        let storage = test_storage().await;
        storage
            .upsert_catalog_item(&sample_item("1", "Riego", Some(vec![1.0, 0.0])))
            .await
            .expect("upsert 1");
        storage
            .upsert_catalog_item(&sample_item("2", "Mallas sombra", None))
            .await
            .expect("upsert 2");
        let mut inactive = sample_item("3", "Riego", Some(vec![0.0, 1.0]));
        inactive.active = false;
        storage.upsert_catalog_item(&inactive).await.expect("upsert 3");

        let embedded = storage.list_embedded_items(None).await.expect("list");
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].embedding.as_deref(), Some(&[1.0, 0.0][..]));

        let riego = storage
            .list_embedded_items(Some("RIEGO"))
            .await
            .expect("filtered");
        assert_eq!(riego.len(), 1);

        let found = storage
            .keyword_search_items("Goteo", None, 10)
            .await
            .expect("keyword");
        assert_eq!(found.len(), 2);
        let none = storage
            .keyword_search_items("goteo", Some("fertilizantes"), 10)
            .await
            .expect("keyword by category");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn catalog_upsert_keeps_embedding_when_absent() {
        let storage = test_storage().await;
        storage
            .upsert_catalog_item(&sample_item("1", "Riego", Some(vec![0.5, 0.5])))
            .await
            .expect("first");
        let mut update = sample_item("1", "Riego", None);
        update.stock = 0;
        storage.upsert_catalog_item(&update).await.expect("second");

        let item = storage
            .get_catalog_item("1")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(item.stock, 0);
        assert!(item.embedding.is_some());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("pf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.expect("open rw");
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.expect("open ro");
        let result = ro.save_post_checked(&sample_post("ro", "2026-03-10"), 10).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
