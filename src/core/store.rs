use crate::core::model::{CacheValidator, DownloadRecord, ErrorCode, Status};
use anyhow::Context;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// Durable record table and validator table, both keyed by record id.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first use
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
              id TEXT PRIMARY KEY,
              url TEXT NOT NULL,
              file_path TEXT NOT NULL,
              tag TEXT NOT NULL DEFAULT '',
              thread_num INTEGER NOT NULL,
              content_length INTEGER NOT NULL,
              completed_size INTEGER NOT NULL,
              finished INTEGER NOT NULL,
              status INTEGER NOT NULL,
              error_code INTEGER NULL,
              create_time INTEGER NOT NULL,
              md5 TEXT NULL,
              chunked INTEGER NOT NULL,
              disable_resume INTEGER NOT NULL,
              extra TEXT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validators (
              id TEXT PRIMARY KEY,
              etag TEXT NULL,
              last_modified TEXT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    pub async fn load_records(&self) -> anyhow::Result<Vec<DownloadRecord>> {
        let rows = sqlx::query(r#"SELECT * FROM records ORDER BY create_time ASC;"#)
            .fetch_all(&self.pool)
            .await
            .context("load records")?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn get_record(&self, id: &str) -> anyhow::Result<Option<DownloadRecord>> {
        let row = sqlx::query(r#"SELECT * FROM records WHERE id = ?;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch record")?;
        Ok(row.as_ref().map(row_to_record))
    }

    pub async fn put_record(&self, record: &DownloadRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO records
              (id, url, file_path, tag, thread_num, content_length, completed_size, finished,
               status, error_code, create_time, md5, chunked, disable_resume, extra, updated_at)
            VALUES
              (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
            .bind(&record.id)
            .bind(&record.url)
            .bind(record.file_path.to_string_lossy().to_string())
            .bind(&record.tag)
            .bind(record.thread_num as i64)
            .bind(record.content_length)
            .bind(record.completed_size as i64)
            .bind(record.finished as i64)
            .bind(record.status.as_i64())
            .bind(record.error_code.map(ErrorCode::as_i64))
            .bind(record.create_time)
            .bind(&record.md5)
            .bind(record.chunked as i64)
            .bind(record.disable_resume as i64)
            .bind(&record.extra)
            .bind(Self::now_epoch())
            .execute(&self.pool)
            .await
            .with_context(|| format!("put record {}", record.id))?;
        Ok(())
    }

    pub async fn delete_record(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM records WHERE id = ?"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_validator(&self, id: &str) -> anyhow::Result<Option<CacheValidator>> {
        let row = sqlx::query(r#"SELECT id, etag, last_modified FROM validators WHERE id = ?;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch validator")?;
        Ok(row.map(|r| CacheValidator {
            id: r.get::<String, _>("id"),
            etag: r.try_get::<Option<String>, _>("etag").ok().flatten(),
            last_modified: r.try_get::<Option<String>, _>("last_modified").ok().flatten(),
        }))
    }

    pub async fn put_validator(&self, validator: &CacheValidator) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO validators (id, etag, last_modified, updated_at)
            VALUES (?, ?, ?, ?);
            "#,
        )
            .bind(&validator.id)
            .bind(&validator.etag)
            .bind(&validator.last_modified)
            .bind(Self::now_epoch())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_validator(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"DELETE FROM validators WHERE id = ?"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(r: &SqliteRow) -> DownloadRecord {
    DownloadRecord {
        id: r.get::<String, _>("id"),
        url: r.get::<String, _>("url"),
        file_path: PathBuf::from(r.get::<String, _>("file_path")),
        tag: r.get::<String, _>("tag"),
        thread_num: r.get::<i64, _>("thread_num").max(1) as usize,
        content_length: r.get::<i64, _>("content_length"),
        completed_size: r.get::<i64, _>("completed_size").max(0) as u64,
        finished: r.get::<i64, _>("finished") != 0,
        progress: 0,
        speed: String::new(),
        status: Status::from_i64(r.get::<i64, _>("status")),
        error_code: r
            .try_get::<Option<i64>, _>("error_code")
            .ok()
            .flatten()
            .and_then(ErrorCode::from_i64),
        create_time: r.get::<i64, _>("create_time"),
        md5: r.try_get::<Option<String>, _>("md5").ok().flatten(),
        chunked: r.get::<i64, _>("chunked") != 0,
        disable_resume: r.get::<i64, _>("disable_resume") != 0,
        extra: r.try_get::<Option<String>, _>("extra").ok().flatten(),
        resume_blocked: false,
    }
}
