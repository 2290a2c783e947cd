pub mod models;
pub use models::*;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
pub use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// 打开（必要时创建）索引数据库并执行迁移
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    let db = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600)) // 10分钟空闲超时
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&db).await?;
    Ok(db)
}

/// 内存数据库（测试用）。只有一个连接，连接关闭后数据即丢失。
pub async fn create_test_pool() -> Result<SqlitePool> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&db).await?;
    Ok(db)
}

impl AppSetting {
    /// 读取配置值
    pub async fn get(pool: &SqlitePool, name: &str) -> Result<Option<String>> {
        let row = sqlx::query_as::<_, AppSetting>("SELECT * FROM app_settings WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;

        Ok(row.and_then(|r| r.value))
    }

    /// 写入配置值
    pub async fn set(pool: &SqlitePool, name: &str, value: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO app_settings (name, value) VALUES (?, ?)
               ON CONFLICT(name) DO UPDATE SET value = excluded.value"#,
        )
        .bind(name)
        .bind(value)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// 配置表是否为空（尚未初始化）
    pub async fn is_empty(pool: &SqlitePool) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_settings")
            .fetch_one(pool)
            .await?;
        Ok(count == 0)
    }
}
