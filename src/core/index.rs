//! 资源索引 - 记录同步目录下每个文件的同步状态
//!
//! 除了基本的增删查改，索引还负责：
//! - 待传输记录与全量记录的分批遍历（keyset 分页，遍历过程中记录离开队列不会导致漏读）
//! - 扫描世代（generation）的维护与孤儿记录检测
//! - 单条记录的状态迁移：`start_progress` / `mark_success` / `mark_failure`

use crate::core::file_state::{hash_file_async, modified_millis};
use crate::db::{setting_keys, AppSetting, Resource, ResourceState, SqlitePool};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// 资源索引
#[derive(Clone)]
pub struct ResourceIndex {
    db: Arc<SqlitePool>,
}

impl ResourceIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// 初始化索引。首次使用或要求清空时，重建全部表内容并记录同步根目录
    pub async fn setup(&self, sync_root: &str, flush: bool) -> Result<()> {
        if !flush && !AppSetting::is_empty(&self.db).await? {
            return Ok(());
        }

        info!("重建索引: {}", sync_root);
        let now = chrono::Utc::now();
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM resources").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM app_settings").execute(&mut *tx).await?;
        for (name, value) in [
            (setting_keys::SYNC_PATH, Some(sync_root.to_string())),
            (setting_keys::INSTALL_DATE, Some(now.to_rfc3339())),
            (setting_keys::LAST_INDEXED_AT, None),
        ] {
            sqlx::query("INSERT INTO app_settings (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// 索引记录的同步根目录
    pub async fn sync_path(&self) -> Result<Option<String>> {
        AppSetting::get(&self.db, setting_keys::SYNC_PATH).await
    }

    pub async fn install_date(&self) -> Result<Option<String>> {
        AppSetting::get(&self.db, setting_keys::INSTALL_DATE).await
    }

    /// 最近一次扫描的世代标记
    pub async fn last_indexed_at(&self) -> Result<Option<i64>> {
        Ok(AppSetting::get(&self.db, setting_keys::LAST_INDEXED_AT)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// 开始新一轮扫描，返回并持久化新的世代标记。
    /// 世代严格递增，同一毫秒内的两次扫描也不会重复。
    pub async fn begin_generation(&self) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let generation = match self.last_indexed_at().await? {
            Some(prev) => now.max(prev + 1),
            None => now,
        };
        AppSetting::set(
            &self.db,
            setting_keys::LAST_INDEXED_AT,
            Some(&generation.to_string()),
        )
        .await?;
        Ok(generation)
    }

    pub async fn find_by_name(&self, filename: &str) -> Result<Option<Resource>> {
        let row = sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Resource>> {
        let row = sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    /// 重新读取一条记录的最新状态
    pub async fn reload(&self, resource: &Resource) -> Result<Option<Resource>> {
        self.find_by_id(resource.id).await
    }

    /// 根据本地文件创建索引记录。文件会计算内容 hash 并进入待传输队列，目录不会。
    pub async fn create(&self, path: &Path, filename: &str, generation: i64) -> Result<Resource> {
        let metadata = tokio::fs::metadata(path).await?;
        let is_dir = metadata.is_dir();
        let checksum = if is_dir {
            None
        } else {
            Some(hash_file_async(path.to_path_buf()).await?)
        };
        let size = if is_dir { 0 } else { metadata.len() as i64 };

        let resource = sqlx::query_as::<_, Resource>(
            r#"INSERT INTO resources
               (filename, size, checksum, is_directory, last_modified, add_date, last_indexed_at, queued, in_progress, times_failed)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
               RETURNING *"#,
        )
        .bind(filename)
        .bind(size)
        .bind(&checksum)
        .bind(is_dir)
        .bind(modified_millis(&metadata))
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(generation)
        .bind(!is_dir)
        .fetch_one(&*self.db)
        .await?;

        debug!("加入索引: {}", filename);
        Ok(resource)
    }

    /// 本地文件已变化：重新计算 hash 并放回待传输队列，失败计数清零
    pub async fn flag_for_update(&self, resource: &Resource, path: &Path) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        let checksum = hash_file_async(path.to_path_buf()).await?;

        sqlx::query(
            r#"UPDATE resources
               SET queued = 1, checksum = ?, size = ?, last_modified = ?, times_failed = 0
               WHERE id = ?"#,
        )
        .bind(&checksum)
        .bind(metadata.len() as i64)
        .bind(modified_millis(&metadata))
        .bind(resource.id)
        .execute(&*self.db)
        .await?;

        debug!("文件已变化，重新排队: {}", resource.filename);
        Ok(())
    }

    /// 标记记录在本轮扫描中被观察到
    pub async fn stamp_generation(&self, id: i64, generation: i64) -> Result<()> {
        sqlx::query("UPDATE resources SET last_indexed_at = ? WHERE id = ?")
            .bind(generation)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// 把 `dir` 本身及其下所有记录标记为本轮已观察到，返回受影响的行数
    pub async fn stamp_subtree(&self, dir: &str, generation: i64) -> Result<u64> {
        let escaped = dir
            .trim_end_matches('/')
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let result = sqlx::query(
            "UPDATE resources SET last_indexed_at = ? WHERE filename = ? OR filename LIKE ? ESCAPE '\\'",
        )
        .bind(generation)
        .bind(dir.trim_end_matches('/'))
        .bind(format!("{}/%", escaped))
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// 是否还有待传输的文件
    pub async fn pending_jobs(&self) -> Result<bool> {
        let (pending,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM resources WHERE queued = 1 AND is_directory = 0)",
        )
        .fetch_one(&*self.db)
        .await?;
        Ok(pending)
    }

    /// 分批遍历待传输的文件
    pub fn pending_batches(&self, batch_size: u32) -> Batches {
        Batches::new(self.db.clone(), BatchKind::Pending, batch_size)
    }

    /// 按文件名升序分批遍历全部记录
    pub fn ordered_batches(&self, batch_size: u32) -> Batches {
        Batches::new(self.db.clone(), BatchKind::Ordered, batch_size)
    }

    /// 本轮扫描未观察到的记录（本地已删除）
    pub async fn orphans(&self, generation: i64) -> Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, Resource>(
            "SELECT * FROM resources WHERE last_indexed_at IS NULL OR last_indexed_at != ? ORDER BY filename",
        )
        .bind(generation)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// 删除所有不属于该世代的记录
    pub async fn delete_all_except(&self, generation: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM resources WHERE last_indexed_at IS NULL OR last_indexed_at != ?",
        )
        .bind(generation)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() > 0 {
            debug!("清理了 {} 条孤儿记录", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    // ============ 状态迁移 ============

    /// Queued -> InProgress，必须在传输开始前调用
    pub async fn start_progress(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE resources SET in_progress = 1 WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// InProgress -> Synchronized
    pub async fn mark_success(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE resources
               SET in_progress = 0, queued = 0, last_synchronized = ?, times_failed = 0
               WHERE id = ?"#,
        )
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// InProgress -> Queued | Abandoned，返回迁移后的状态
    pub async fn mark_failure(&self, id: i64, max_attempts: u32) -> Result<ResourceState> {
        // SET 中的表达式读取的都是更新前的值
        let (times_failed, queued): (u32, bool) = sqlx::query_as(
            r#"UPDATE resources
               SET times_failed = times_failed + 1,
                   in_progress = 0,
                   queued = (times_failed + 1 < ?)
               WHERE id = ?
               RETURNING times_failed, queued"#,
        )
        .bind(max_attempts)
        .bind(id)
        .fetch_one(&*self.db)
        .await?;

        debug!("记录 {} 失败 {} 次, 重新排队: {}", id, times_failed, queued);
        Ok(if queued {
            ResourceState::Queued
        } else {
            ResourceState::Abandoned
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum BatchKind {
    /// queued = 1 且非目录，按 id 翻页
    Pending,
    /// 全部记录，按 filename 翻页
    Ordered,
}

/// 惰性分批读取索引记录
pub struct Batches {
    db: Arc<SqlitePool>,
    kind: BatchKind,
    batch_size: u32,
    last_id: i64,
    last_filename: String,
    done: bool,
}

impl Batches {
    fn new(db: Arc<SqlitePool>, kind: BatchKind, batch_size: u32) -> Self {
        Self {
            db,
            kind,
            batch_size: batch_size.max(1),
            last_id: 0,
            last_filename: String::new(),
            done: false,
        }
    }

    /// 读取下一批，遍历结束时返回 None
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Resource>>> {
        if self.done {
            return Ok(None);
        }

        let rows = match self.kind {
            BatchKind::Pending => {
                sqlx::query_as::<_, Resource>(
                    r#"SELECT * FROM resources
                       WHERE queued = 1 AND is_directory = 0 AND id > ?
                       ORDER BY id LIMIT ?"#,
                )
                .bind(self.last_id)
                .bind(self.batch_size)
                .fetch_all(&*self.db)
                .await?
            }
            BatchKind::Ordered => {
                sqlx::query_as::<_, Resource>(
                    "SELECT * FROM resources WHERE filename > ? ORDER BY filename LIMIT ?",
                )
                .bind(&self.last_filename)
                .bind(self.batch_size)
                .fetch_all(&*self.db)
                .await?
            }
        };

        if rows.len() < self.batch_size as usize {
            self.done = true;
        }
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        self.last_id = last.id;
        self.last_filename = last.filename.clone();

        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::calculate_hash;
    use crate::db::create_test_pool;

    async fn index() -> ResourceIndex {
        let index = ResourceIndex::new(Arc::new(create_test_pool().await.unwrap()));
        index.setup("/data", false).await.unwrap();
        index
    }

    async fn add_file(index: &ResourceIndex, dir: &Path, name: &str, data: &[u8], generation: i64) -> Resource {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        index.create(&path, name, generation).await.unwrap()
    }

    #[tokio::test]
    async fn test_setup_records_sync_path_once() {
        let index = index().await;
        assert_eq!(index.sync_path().await.unwrap().as_deref(), Some("/data"));
        assert!(index.install_date().await.unwrap().is_some());
        assert_eq!(index.last_indexed_at().await.unwrap(), None);

        // 已初始化时不覆盖
        index.setup("/elsewhere", false).await.unwrap();
        assert_eq!(index.sync_path().await.unwrap().as_deref(), Some("/data"));

        index.setup("/elsewhere", true).await.unwrap();
        assert_eq!(index.sync_path().await.unwrap().as_deref(), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_flush_clears_resources() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        add_file(&index, dir.path(), "a.txt", b"a", 1).await;
        assert_eq!(index.count().await.unwrap(), 1);

        index.setup("/data", true).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generation_strictly_increases() {
        let index = index().await;
        let g1 = index.begin_generation().await.unwrap();
        let g2 = index.begin_generation().await.unwrap();
        assert!(g2 > g1);
        assert_eq!(index.last_indexed_at().await.unwrap(), Some(g2));
    }

    #[tokio::test]
    async fn test_create_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;

        let file = add_file(&index, dir.path(), "a.txt", b"0123456789", 7).await;
        assert_eq!(file.size, 10);
        assert_eq!(file.checksum, Some(calculate_hash(b"0123456789")));
        assert!(file.queued);
        assert!(!file.in_progress);
        assert_eq!(file.times_failed, 0);
        assert_eq!(file.last_indexed_at, Some(7));

        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let sub = index.create(&dir.path().join("sub"), "sub", 7).await.unwrap();
        assert!(sub.is_directory);
        assert!(!sub.queued);
        assert_eq!(sub.checksum, None);

        assert_eq!(index.find_by_name("a.txt").await.unwrap(), Some(file));
        assert_eq!(index.find_by_name("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_jobs_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        index.create(&dir.path().join("sub"), "sub", 1).await.unwrap();
        assert!(!index.pending_jobs().await.unwrap());

        let file = add_file(&index, dir.path(), "a.txt", b"a", 1).await;
        assert!(index.pending_jobs().await.unwrap());

        index.start_progress(file.id).await.unwrap();
        index.mark_success(file.id).await.unwrap();
        assert!(!index.pending_jobs().await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_batches_do_not_skip_rows_leaving_queue() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        for i in 0..5 {
            add_file(&index, dir.path(), &format!("f{i}.txt"), b"x", 1).await;
        }

        let mut batches = index.pending_batches(2);
        let mut seen = Vec::new();
        while let Some(batch) = batches.next_batch().await.unwrap() {
            assert!(batch.len() <= 2);
            for r in batch {
                // 处理后离开队列
                index.start_progress(r.id).await.unwrap();
                index.mark_success(r.id).await.unwrap();
                seen.push(r.filename);
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(!index.pending_jobs().await.unwrap());
    }

    #[tokio::test]
    async fn test_ordered_batches_sorted_by_filename() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        for name in ["c.txt", "a.txt", "b.txt"] {
            add_file(&index, dir.path(), name, b"x", 1).await;
        }

        let mut batches = index.ordered_batches(2);
        let first = batches.next_batch().await.unwrap().unwrap();
        let second = batches.next_batch().await.unwrap().unwrap();
        assert!(batches.next_batch().await.unwrap().is_none());

        let names: Vec<_> = first.iter().chain(second.iter()).map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_empty_index_has_no_batches() {
        let index = index().await;
        assert!(index.ordered_batches(10).next_batch().await.unwrap().is_none());
        assert!(index.pending_batches(10).next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_requeues_until_limit() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        let file = add_file(&index, dir.path(), "a.txt", b"a", 1).await;

        for attempt in 1..=3u32 {
            index.start_progress(file.id).await.unwrap();
            let state = index.mark_failure(file.id, 3).await.unwrap();
            let reloaded = index.reload(&file).await.unwrap().unwrap();
            assert_eq!(reloaded.times_failed, attempt);
            assert!(!reloaded.in_progress);
            if attempt < 3 {
                assert_eq!(state, ResourceState::Queued);
                assert!(reloaded.queued);
            } else {
                assert_eq!(state, ResourceState::Abandoned);
                assert!(!reloaded.queued);
                assert_eq!(reloaded.state(), ResourceState::Abandoned);
            }
        }
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        let file = add_file(&index, dir.path(), "a.txt", b"a", 1).await;

        index.start_progress(file.id).await.unwrap();
        index.mark_failure(file.id, 5).await.unwrap();
        index.start_progress(file.id).await.unwrap();
        index.mark_success(file.id).await.unwrap();

        let r = index.reload(&file).await.unwrap().unwrap();
        assert_eq!(r.times_failed, 0);
        assert!(!r.queued);
        assert!(!r.in_progress);
        assert!(r.last_synchronized.is_some());
        assert_eq!(r.state(), ResourceState::Synchronized);
    }

    #[tokio::test]
    async fn test_flag_for_update_refreshes_and_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        let file = add_file(&index, dir.path(), "a.txt", b"a", 1).await;
        index.start_progress(file.id).await.unwrap();
        index.mark_failure(file.id, 1).await.unwrap();

        std::fs::write(dir.path().join("a.txt"), b"longer content").unwrap();
        index.flag_for_update(&file, &dir.path().join("a.txt")).await.unwrap();

        let r = index.reload(&file).await.unwrap().unwrap();
        assert!(r.queued);
        assert_eq!(r.times_failed, 0);
        assert_eq!(r.size, 14);
        assert_eq!(r.checksum, Some(calculate_hash(b"longer content")));
    }

    #[tokio::test]
    async fn test_orphans_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        let kept = add_file(&index, dir.path(), "kept.txt", b"k", 1).await;
        add_file(&index, dir.path(), "gone.txt", b"g", 1).await;

        index.stamp_generation(kept.id, 2).await.unwrap();

        let orphans = index.orphans(2).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].filename, "gone.txt");

        assert_eq!(index.delete_all_except(2).await.unwrap(), 1);
        assert!(index.find_by_name("gone.txt").await.unwrap().is_none());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stamp_subtree_stays_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let index = index().await;
        for sub in ["locked", "locked2", "lock_d", "lockxd"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        add_file(&index, dir.path(), "locked/a.txt", b"a", 1).await;
        add_file(&index, dir.path(), "locked/deep.txt", b"d", 1).await;
        add_file(&index, dir.path(), "locked2/b.txt", b"b", 1).await;
        add_file(&index, dir.path(), "lock_d/c.txt", b"c", 1).await;
        add_file(&index, dir.path(), "lockxd/e.txt", b"e", 1).await;

        assert_eq!(index.stamp_subtree("locked", 2).await.unwrap(), 2);
        // `_` 不能当作通配符
        assert_eq!(index.stamp_subtree("lock_d", 2).await.unwrap(), 1);

        let orphans: Vec<String> = index
            .orphans(2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(orphans, vec!["locked2/b.txt", "lockxd/e.txt"]);
    }
}
