use log::info;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        // Strip the sqlite: / sqlite:// prefix to get the file path, so the
        // parent directory can be created before the pool opens the file.
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        // An in-memory database is per-connection, so the pool must hold
        // exactly one or every connection sees a different empty database.
        let max_connections = if file_path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("[DB] Connected to {}", database_url);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Communities
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS communities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tags TEXT NOT NULL,
                description TEXT NOT NULL,
                visibility TEXT NOT NULL DEFAULT 'global',
                lng REAL NOT NULL DEFAULT 0,
                lat REAL NOT NULL DEFAULT 0,
                admin_ip TEXT,
                embedding TEXT,
                members_count INTEGER NOT NULL DEFAULT 0,
                activity_score REAL NOT NULL DEFAULT 0,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Pods
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pods (
                id TEXT PRIMARY KEY,
                community_id TEXT NOT NULL,
                created_by TEXT NOT NULL,
                pod_type TEXT NOT NULL DEFAULT 'chat',
                title TEXT,
                expires_at INTEGER NOT NULL,
                lng REAL,
                lat REAL,
                active INTEGER NOT NULL DEFAULT 1,
                last_activity INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Pod membership, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pod_members (
                pod_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (pod_id, user_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Transcripts, append-only. seq is the order of record: rows are only
        // ever inserted, never rewritten, so concurrent senders cannot clobber
        // each other's appends.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pod_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                pod_id TEXT NOT NULL,
                sender_id TEXT,
                text TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                is_generated INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pods_active ON pods(active, expires_at);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pod_messages_pod ON pod_messages(pod_id, seq);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_communities_created ON communities(created_at DESC);")
            .execute(&self.pool)
            .await?;

        info!("[DB] Migrations completed");
        Ok(())
    }
}
