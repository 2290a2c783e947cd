use crate::core::file_state::modified_millis;
use crate::core::index::ResourceIndex;
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 文件扫描器配置
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// 是否把目录也记入索引
    pub include_dirs: bool,
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
}

/// 一次扫描的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub generation: i64,
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// 被排除或无法读取的条目
    pub skipped: usize,
    /// 遍历出错且无法定位出错的子目录，本轮结果不能用于孤儿判断
    pub incomplete: bool,
}

impl ScanSummary {
    /// 本轮观察到的条目数
    pub fn scanned(&self) -> usize {
        self.added + self.changed + self.unchanged
    }
}

struct WalkEntry {
    path: PathBuf,
    relative: String,
    is_dir: bool,
}

/// 一次目录遍历的结果
#[derive(Default)]
struct WalkOutcome {
    entries: Vec<WalkEntry>,
    /// 遍历出错的相对路径，其下已有的记录本轮视为仍然存在
    failed: Vec<String>,
    /// 未被记录的条目（非 UTF-8 路径等）
    unnamed: usize,
    incomplete: bool,
}

/// 本地目录扫描器，使索引与磁盘上的内容一致
pub struct Scanner {
    index: ResourceIndex,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(index: ResourceIndex, config: ScanConfig) -> Self {
        Self { index, config }
    }

    /// 检查路径是否应该被排除
    fn should_exclude(&self, path: &str) -> bool {
        self.config
            .exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(path, pattern))
    }

    /// 扫描同步根目录，返回本轮统计。扫描结束后，世代不等于
    /// `summary.generation` 的记录即为孤儿。
    pub async fn scan(&self, root: &Path) -> Result<ScanSummary> {
        let generation = self.index.begin_generation().await?;
        info!("开始扫描: {:?}, generation={}", root, generation);

        let outcome = walk(root.to_path_buf()).await?;
        let summary = self.apply(outcome, generation).await?;

        info!(
            "扫描完成: 新增 {}, 变化 {}, 未变 {}, 跳过 {}",
            summary.added, summary.changed, summary.unchanged, summary.skipped
        );
        Ok(summary)
    }

    /// 把遍历结果写入索引
    async fn apply(&self, outcome: WalkOutcome, generation: i64) -> Result<ScanSummary> {
        let mut summary = ScanSummary {
            generation,
            skipped: outcome.unnamed,
            incomplete: outcome.incomplete,
            ..Default::default()
        };

        for entry in outcome.entries {
            if entry.is_dir && !self.config.include_dirs {
                continue;
            }
            if self.should_exclude(&entry.relative) {
                debug!("排除: {}", entry.relative);
                summary.skipped += 1;
                continue;
            }
            self.visit(&entry, generation, &mut summary).await?;
        }

        for dir in &outcome.failed {
            let kept = self.index.stamp_subtree(dir, generation).await?;
            warn!("无法遍历 {}, 保留其下 {} 条记录", dir, kept);
            summary.skipped += 1;
        }

        Ok(summary)
    }

    async fn visit(&self, entry: &WalkEntry, generation: i64, summary: &mut ScanSummary) -> Result<()> {
        let Some(existing) = self.index.find_by_name(&entry.relative).await? else {
            match self.index.create(&entry.path, &entry.relative, generation).await {
                Ok(_) => summary.added += 1,
                Err(e) => {
                    warn!("无法索引文件 {}: {}", entry.relative, e);
                    summary.skipped += 1;
                }
            }
            return Ok(());
        };

        if !entry.is_dir {
            let changed = match tokio::fs::metadata(&entry.path).await {
                Ok(metadata) => {
                    metadata.len() as i64 != existing.size
                        || modified_millis(&metadata) != existing.last_modified
                }
                Err(e) => {
                    warn!("无法读取文件信息 {}: {}", entry.relative, e);
                    false
                }
            };

            if changed {
                match self.index.flag_for_update(&existing, &entry.path).await {
                    Ok(()) => summary.changed += 1,
                    // 文件仍在磁盘上，照常打上世代标记，避免被当成孤儿
                    Err(e) => {
                        warn!("无法重新计算 hash {}: {}", entry.relative, e);
                        summary.skipped += 1;
                    }
                }
            } else {
                summary.unchanged += 1;
            }
        } else {
            summary.unchanged += 1;
        }

        self.index.stamp_generation(existing.id, generation).await
    }
}

/// 在阻塞线程池中遍历目录
async fn walk(root: PathBuf) -> Result<WalkOutcome> {
    let outcome = tokio::task::spawn_blocking(move || {
        let mut outcome = WalkOutcome::default();
        let relative_of = |path: &Path| {
            path.strip_prefix(&root)
                .ok()
                .and_then(|p| p.to_str())
                .map(|p| p.replace('\\', "/"))
        };

        for entry in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("遍历目录出错: {}", e);
                    match e.path().and_then(relative_of) {
                        Some(relative) if !relative.is_empty() => outcome.failed.push(relative),
                        _ => outcome.incomplete = true,
                    }
                    continue;
                }
            };
            let file_type = entry.file_type();
            if !file_type.is_file() && !file_type.is_dir() {
                continue;
            }
            let Some(relative) = relative_of(entry.path()) else {
                warn!("无法处理的路径: {:?}", entry.path());
                outcome.unnamed += 1;
                continue;
            };

            outcome.entries.push(WalkEntry {
                path: entry.path().to_path_buf(),
                relative,
                is_dir: file_type.is_dir(),
            });
        }

        outcome
    })
    .await?;

    Ok(outcome)
}

/// 简单的 glob 模式匹配（不区分大小写）
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let path = path.to_lowercase();
    let pattern = pattern.to_lowercase();

    // 处理 ** 通配符
    if pattern.contains("**") {
        let parts: Vec<&str> = pattern.split("**").collect();
        if parts.len() == 2 {
            let prefix = parts[0].trim_end_matches('/');
            let suffix = parts[1].trim_start_matches('/');

            if prefix.is_empty() && suffix.is_empty() {
                return true;
            }
            if !prefix.is_empty() && !path.starts_with(prefix) {
                return false;
            }
            if !suffix.is_empty() && !path.ends_with(suffix) {
                return false;
            }
            return true;
        }
    }

    // 处理 * 通配符，只匹配文件名部分
    if pattern.contains('*') {
        let regex_pattern = regex::escape(&pattern).replace("\\*", "[^/]*");
        if let Ok(re) = regex::Regex::new(&format!("^{}$", regex_pattern)) {
            let name = path.rsplit('/').next().unwrap_or(&path);
            return re.is_match(&path) || re.is_match(name);
        }
    }

    // 精确匹配
    path == pattern || path.ends_with(&format!("/{}", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::file_state::calculate_hash;
    use crate::db::create_test_pool;
    use std::sync::Arc;

    async fn setup() -> (tempfile::TempDir, ResourceIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = ResourceIndex::new(Arc::new(create_test_pool().await.unwrap()));
        index.setup(dir.path().to_str().unwrap(), false).await.unwrap();
        (dir, index)
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern(".git/config", ".git/**"));
        assert!(matches_pattern("a/b/Thumbs.db", "thumbs.db"));
        assert!(matches_pattern("notes.TMP", "*.tmp"));
        assert!(matches_pattern("sub/notes.tmp", "*.tmp"));
        assert!(!matches_pattern("notes.txt", "*.tmp"));
        assert!(!matches_pattern("src/main.rs", ".git/**"));
    }

    #[tokio::test]
    async fn test_scan_indexes_files_with_live_metadata() {
        let (dir, index) = setup().await;
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), [7u8; 20]).unwrap();

        let scanner = Scanner::new(index.clone(), ScanConfig::default());
        let summary = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.scanned(), 2);

        for (name, data) in [("a.txt", b"0123456789".to_vec()), ("sub/b.txt", vec![7u8; 20])] {
            let r = index.find_by_name(name).await.unwrap().unwrap();
            let metadata = std::fs::metadata(dir.path().join(name)).unwrap();
            assert_eq!(r.size, data.len() as i64);
            assert_eq!(r.checksum, Some(calculate_hash(&data)));
            assert_eq!(r.last_modified, modified_millis(&metadata));
            assert!(r.queued);
            assert_eq!(r.last_indexed_at, Some(summary.generation));
        }
        // 默认不记录目录
        assert!(index.find_by_name("sub").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rescan_detects_changes_and_orphans() {
        let (dir, index) = setup().await;
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let scanner = Scanner::new(index.clone(), ScanConfig::default());
        scanner.scan(dir.path()).await.unwrap();

        let b = index.find_by_name("b.txt").await.unwrap().unwrap();
        index.start_progress(b.id).await.unwrap();
        index.mark_success(b.id).await.unwrap();

        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bigger").unwrap();

        let summary = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(summary.changed, 1);

        let b = index.find_by_name("b.txt").await.unwrap().unwrap();
        assert!(b.queued);
        assert_eq!(b.checksum, Some(calculate_hash(b"bigger")));

        let orphans = index.orphans(summary.generation).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].filename, "a.txt");
    }

    #[tokio::test]
    async fn test_unchanged_file_only_gets_stamped() {
        let (dir, index) = setup().await;
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let scanner = Scanner::new(index.clone(), ScanConfig::default());
        let first = scanner.scan(dir.path()).await.unwrap();
        let a = index.find_by_name("a.txt").await.unwrap().unwrap();
        index.start_progress(a.id).await.unwrap();
        index.mark_success(a.id).await.unwrap();

        let second = scanner.scan(dir.path()).await.unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(second.unchanged, 1);

        let a = index.find_by_name("a.txt").await.unwrap().unwrap();
        assert!(!a.queued);
        assert_eq!(a.last_indexed_at, Some(second.generation));
        assert!(index.orphans(second.generation).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_excludes_and_directories() {
        let (dir, index) = setup().await;
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("skip.tmp"), b"s").unwrap();

        let config = ScanConfig {
            include_dirs: true,
            exclude_patterns: vec!["*.tmp".to_string()],
        };
        let summary = Scanner::new(index.clone(), config).scan(dir.path()).await.unwrap();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.skipped, 1);

        let sub = index.find_by_name("sub").await.unwrap().unwrap();
        assert!(sub.is_directory);
        assert!(!sub.queued);
        assert!(index.find_by_name("skip.tmp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_subtree_is_not_orphaned() {
        let (dir, index) = setup().await;
        std::fs::create_dir(dir.path().join("locked")).unwrap();
        std::fs::write(dir.path().join("locked/x.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"t").unwrap();

        let scanner = Scanner::new(index.clone(), ScanConfig::default());
        scanner.scan(dir.path()).await.unwrap();

        // 第二轮遍历进不去 locked/
        let generation = index.begin_generation().await.unwrap();
        let mut outcome = walk(dir.path().to_path_buf()).await.unwrap();
        outcome.entries.retain(|e| !e.relative.starts_with("locked"));
        outcome.failed.push("locked".to_string());

        let summary = scanner.apply(outcome, generation).await.unwrap();
        assert!(!summary.incomplete);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.skipped, 1);

        let x = index.find_by_name("locked/x.txt").await.unwrap().unwrap();
        assert_eq!(x.last_indexed_at, Some(generation));
        assert!(index.orphans(generation).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlocated_walk_error_marks_scan_incomplete() {
        let (dir, index) = setup().await;
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let scanner = Scanner::new(index.clone(), ScanConfig::default());
        let clean = scanner.scan(dir.path()).await.unwrap();
        assert!(!clean.incomplete);

        let generation = index.begin_generation().await.unwrap();
        let outcome = WalkOutcome {
            incomplete: true,
            ..Default::default()
        };
        let summary = scanner.apply(outcome, generation).await.unwrap();
        assert!(summary.incomplete);
    }

    #[tokio::test]
    async fn test_missing_root_reports_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = walk(dir.path().join("absent")).await.unwrap();
        assert!(outcome.entries.is_empty());
        assert!(outcome.incomplete);
    }
}
