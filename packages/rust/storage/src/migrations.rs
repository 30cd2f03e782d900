//! SQL migration definitions for the Postforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: posts",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Generated posts. Never deleted, only superseded.
CREATE TABLE IF NOT EXISTS posts (
    id                     TEXT PRIMARY KEY,
    external_id            TEXT UNIQUE,
    date_for               TEXT NOT NULL,
    created_at             TEXT NOT NULL,
    channel                TEXT NOT NULL,
    post_type              TEXT NOT NULL,
    content_tone           TEXT NOT NULL DEFAULT '',
    topic                  TEXT NOT NULL,
    topic_hash             TEXT NOT NULL,
    problem_identified     TEXT NOT NULL DEFAULT '',
    caption                TEXT NOT NULL,
    image_prompt           TEXT NOT NULL,
    carousel_slides_json   TEXT NOT NULL DEFAULT '[]',
    needs_music            INTEGER NOT NULL DEFAULT 0,
    posting_time           TEXT,
    cta                    TEXT,
    hashtags_json          TEXT NOT NULL DEFAULT '[]',
    selected_product_id    TEXT,
    formatted_content_json TEXT NOT NULL DEFAULT 'null',
    status                 TEXT NOT NULL DEFAULT 'draft',
    user_feedback          TEXT,
    possibly_duplicate     INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_posts_topic_hash ON posts(topic_hash);
CREATE INDEX IF NOT EXISTS idx_posts_date_created ON posts(date_for, created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Catalog items with precomputed embeddings",
            sql: r#"
CREATE TABLE IF NOT EXISTS catalog_items (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    sku            TEXT NOT NULL DEFAULT '',
    category       TEXT NOT NULL,
    description    TEXT NOT NULL DEFAULT '',
    cost           REAL NOT NULL DEFAULT 0,
    shipping_cost  REAL NOT NULL DEFAULT 0,
    margin         REAL,
    stock          INTEGER NOT NULL DEFAULT 0,
    active         INTEGER NOT NULL DEFAULT 1,
    specs_json     TEXT NOT NULL DEFAULT '[]',
    embedding_json TEXT,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_catalog_items_category ON catalog_items(category);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
