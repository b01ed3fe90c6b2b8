use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an already-open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Collections group documents and own one topic generation at a time
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT,
            is_stale INTEGER NOT NULL DEFAULT 0,
            active_job_id INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            source_path TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            fragment_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB,
            UNIQUE(document_id, fragment_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discovery_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED')),
            progress_step INTEGER NOT NULL DEFAULT 0,
            progress_total INTEGER NOT NULL DEFAULT 10,
            progress_label TEXT,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            heartbeat_at INTEGER,
            finished_at INTEGER,
            FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one PENDING/RUNNING job per collection
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_discovery_jobs_one_active
        ON discovery_jobs(collection_id)
        WHERE status IN ('PENDING', 'RUNNING')
        "#,
    )
    .execute(pool)
    .await?;

    // Topics are tagged with the job that produced them (their generation)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_id INTEGER NOT NULL,
            job_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            summary TEXT NOT NULL,
            keywords_json TEXT NOT NULL DEFAULT '[]',
            centroid BLOB NOT NULL,
            document_count INTEGER NOT NULL DEFAULT 0,
            size_score REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topic_insights (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL UNIQUE,
            summary TEXT NOT NULL,
            themes_json TEXT NOT NULL DEFAULT '[]',
            questions_json TEXT NOT NULL DEFAULT '[]',
            related_concepts_json TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            topic_id INTEGER NOT NULL,
            relevance_score REAL NOT NULL,
            classification TEXT NOT NULL CHECK (classification IN ('primary', 'secondary')),
            UNIQUE(document_id, topic_id),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topic_relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_id INTEGER NOT NULL,
            source_topic_id INTEGER NOT NULL,
            target_topic_id INTEGER NOT NULL,
            similarity_score REAL NOT NULL,
            relationship_type TEXT NOT NULL DEFAULT 'SIMILAR',
            UNIQUE(source_topic_id, target_topic_id),
            CHECK (source_topic_id < target_topic_id),
            FOREIGN KEY (source_topic_id) REFERENCES topics(id) ON DELETE CASCADE,
            FOREIGN KEY (target_topic_id) REFERENCES topics(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_document ON fragments(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_topics_collection ON topics(collection_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_topics_topic ON document_topics(topic_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_topic_relationships_collection ON topic_relationships(collection_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discovery_jobs_collection ON discovery_jobs(collection_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
