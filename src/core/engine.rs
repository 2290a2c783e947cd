use crate::config::Settings;
use crate::core::file_state::is_synchronized;
use crate::core::index::ResourceIndex;
use crate::core::pool::WorkerPool;
use crate::core::scanner::{ScanConfig, ScanSummary, Scanner};
use crate::core::transfer::ChunkedTransfer;
use crate::db::{Resource, ResourceState};
use crate::storage::RemoteStore;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发传输数
    pub max_threads: usize,
    pub max_upload_attempts: u32,
    /// 单次运行内每个文件的最大下载次数
    pub max_download_attempts: u32,
    /// 分块大小（字节）
    pub chunk_size: u64,
    /// 每批处理的记录数
    pub batch_size: u32,
    /// 扫描配置
    pub scan_config: ScanConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            max_upload_attempts: 3,
            max_download_attempts: 3,
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            scan_config: ScanConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_threads: settings.max_threads,
            max_upload_attempts: settings.max_upload_attempts,
            max_download_attempts: settings.max_download_attempts,
            chunk_size: settings.chunk_size,
            batch_size: settings.batch_size,
            scan_config: ScanConfig {
                include_dirs: settings.include_directories,
                exclude_patterns: settings.exclude_patterns.clone(),
            },
        }
    }
}

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// 本地 -> 远端
    Push,
    /// 远端 -> 本地
    Pull,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Push => write!(f, "push"),
            SyncDirection::Pull => write!(f, "pull"),
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub direction: SyncDirection,
    pub start_time: i64,
    pub end_time: i64,
    pub files_scanned: u32,
    pub files_transferred: u32,
    pub files_deleted: u32,
    /// 本次运行最终失败的文件
    pub failed: Vec<String>,
    /// 耗时（秒）
    pub duration: u64,
}

impl SyncReport {
    fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            start_time: chrono::Utc::now().timestamp(),
            end_time: 0,
            files_scanned: 0,
            files_transferred: 0,
            files_deleted: 0,
            failed: Vec::new(),
            duration: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.end_time = chrono::Utc::now().timestamp();
        self.duration = (self.end_time - self.start_time).max(0) as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 同步引擎
pub struct SyncEngine {
    index: ResourceIndex,
    transfer: ChunkedTransfer,
    root: PathBuf,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        index: ResourceIndex,
        store: Arc<dyn RemoteStore>,
        root: PathBuf,
        config: SyncConfig,
    ) -> Result<Self> {
        let transfer = ChunkedTransfer::new(store, config.chunk_size)?;
        Ok(Self {
            index,
            transfer,
            root,
            config,
        })
    }

    pub fn index(&self) -> &ResourceIndex {
        &self.index
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn run(&self, direction: SyncDirection) -> Result<SyncReport> {
        match direction {
            SyncDirection::Push => self.push().await,
            SyncDirection::Pull => self.pull().await,
        }
    }

    /// 本地 -> 远端：扫描、上传待传输文件、删除本地已不存在的远端对象
    pub async fn push(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(SyncDirection::Push);
        info!("开始上传: {:?} -> {}", self.root, self.transfer.store().name());

        // 目录不存在时所有记录都会被当成孤儿
        if !tokio::fs::metadata(&self.root).await.is_ok_and(|m| m.is_dir()) {
            anyhow::bail!("同步目录不存在: {:?}", self.root);
        }

        let scanner = Scanner::new(self.index.clone(), self.config.scan_config.clone());
        let summary = scanner.scan(&self.root).await?;
        report.files_scanned = summary.scanned() as u32;

        let mut pool = WorkerPool::new(self.config.max_threads);
        let mut batch_no = 0;
        while self.index.pending_jobs().await? {
            let Some(batch) = self
                .index
                .pending_batches(self.config.batch_size)
                .next_batch()
                .await?
            else {
                break;
            };
            batch_no += 1;
            debug!("第 {} 批: {} 个文件", batch_no, batch.len());

            let mut started_err = None;
            for resource in &batch {
                if let Err(e) = self.index.start_progress(resource.id).await {
                    started_err = Some(e);
                    break;
                }
                pool.submit(self.upload_task(resource));
            }
            // 出错也要等已提交的任务结束，它们还会写索引
            let joined = pool.join().await;
            if joined.crashed > 0 {
                warn!("第 {} 批有 {} 个任务异常退出", batch_no, joined.crashed);
            }
            if let Some(e) = started_err {
                return Err(e);
            }

            self.reconcile_uploads(&batch, &mut report).await?;
            info!(
                "第 {} 批完成, 已上传 {} 个文件, 耗时 {:.1}s",
                batch_no,
                report.files_transferred,
                started.elapsed().as_secs_f64()
            );
        }

        self.delete_orphans(&summary, &mut report).await?;

        let report = report.finish();
        info!(
            "上传完成: 扫描 {}, 上传 {}, 删除 {}, 失败 {}, 耗时 {:.1}s",
            report.files_scanned,
            report.files_transferred,
            report.files_deleted,
            report.failed.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    /// 删除本地已不存在的远端对象，并清理对应记录
    async fn delete_orphans(&self, summary: &ScanSummary, report: &mut SyncReport) -> Result<()> {
        if summary.incomplete {
            warn!("本轮扫描不完整，跳过远端删除");
            return Ok(());
        }

        let generation = summary.generation;
        for orphan in self.index.orphans(generation).await? {
            if orphan.is_directory {
                continue;
            }
            if self.transfer.delete(orphan.remote_key()).await {
                debug!("已删除远端对象: {}", orphan.filename);
                report.files_deleted += 1;
            } else {
                warn!("删除远端对象失败: {}", orphan.filename);
            }
        }
        self.index.delete_all_except(generation).await?;
        Ok(())
    }

    fn upload_task(&self, resource: &Resource) -> impl std::future::Future<Output = ()> + Send + 'static {
        let index = self.index.clone();
        let transfer = self.transfer.clone();
        let path = self.root.join(&resource.filename);
        let key = resource.remote_key().to_string();
        let id = resource.id;

        async move {
            match transfer.write(&path, &key).await {
                Ok(()) => {
                    if let Err(e) = index.mark_success(id).await {
                        error!("更新索引失败 {}: {}", key, e);
                    }
                }
                Err(e) => warn!("上传失败 {}: {}", key, e),
            }
        }
    }

    /// 批次结束后仍处于 in_progress 的记录都视为失败
    async fn reconcile_uploads(&self, batch: &[Resource], report: &mut SyncReport) -> Result<()> {
        for resource in batch {
            let Some(current) = self.index.reload(resource).await? else {
                continue;
            };

            if current.in_progress {
                let state = self
                    .index
                    .mark_failure(current.id, self.config.max_upload_attempts)
                    .await?;
                if state == ResourceState::Abandoned {
                    error!(
                        "放弃上传 {} (已失败 {} 次)",
                        current.filename, self.config.max_upload_attempts
                    );
                    report.failed.push(current.filename);
                }
            } else if !current.queued {
                report.files_transferred += 1;
            }
        }
        Ok(())
    }

    /// 远端 -> 本地：按文件名顺序恢复索引中的全部记录
    pub async fn pull(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(SyncDirection::Pull);
        info!("开始下载: {} -> {:?}", self.transfer.store().name(), self.root);

        tokio::fs::create_dir_all(&self.root).await?;

        let mut pool = WorkerPool::new(self.config.max_threads);
        let mut batches = self.index.ordered_batches(self.config.batch_size);
        while let Some(batch) = batches.next_batch().await? {
            report.files_scanned += batch.len() as u32;
            self.pull_batch(batch, &mut pool, &mut report).await?;
        }

        let report = report.finish();
        info!(
            "下载完成: 共 {}, 下载 {}, 失败 {}, 耗时 {:.1}s",
            report.files_scanned,
            report.files_transferred,
            report.failed.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn pull_batch(
        &self,
        batch: Vec<Resource>,
        pool: &mut WorkerPool,
        report: &mut SyncReport,
    ) -> Result<()> {
        // id -> (记录, 本次运行已尝试次数)
        let mut pending: HashMap<i64, (Resource, u32)> =
            batch.into_iter().map(|r| (r.id, (r, 0))).collect();

        while !pending.is_empty() {
            let mut dispatched = Vec::new();
            let ids: Vec<i64> = pending.keys().copied().collect();

            for id in ids {
                let Some((resource, attempts)) = pending.get_mut(&id) else {
                    continue;
                };
                let local_path = self.root.join(&resource.filename);

                if resource.is_directory {
                    tokio::fs::create_dir_all(&local_path).await?;
                    pending.remove(&id);
                } else if *attempts >= self.config.max_download_attempts {
                    error!("放弃下载 {} (已尝试 {} 次)", resource.filename, attempts);
                    report.failed.push(resource.filename.clone());
                    pending.remove(&id);
                } else if self.local_matches(resource, &local_path).await {
                    pending.remove(&id);
                } else {
                    *attempts += 1;
                    pool.submit(self.download_task(resource, local_path));
                    dispatched.push(id);
                }
            }

            if dispatched.is_empty() {
                continue;
            }
            pool.join().await;

            for id in dispatched {
                let Some((resource, _)) = pending.get(&id) else {
                    continue;
                };
                let local_path = self.root.join(&resource.filename);
                if self.local_matches(resource, &local_path).await {
                    set_executable(&local_path).await;
                    report.files_transferred += 1;
                    pending.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn local_matches(&self, resource: &Resource, local_path: &Path) -> bool {
        match is_synchronized(resource, local_path).await {
            Ok(synced) => synced,
            Err(e) => {
                warn!("检查本地文件失败 {}: {}", resource.filename, e);
                false
            }
        }
    }

    fn download_task(
        &self,
        resource: &Resource,
        local_path: PathBuf,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let transfer = self.transfer.clone();
        let key = resource.remote_key().to_string();

        async move {
            if let Err(e) = transfer.copy(&key, &local_path).await {
                warn!("下载失败 {}: {}", key, e);
            }
        }
    }
}

/// 下载的文件统一设为 0755
#[cfg(unix)]
async fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let permissions = std::fs::Permissions::from_mode(0o755);
    if let Err(e) = tokio::fs::set_permissions(path, permissions).await {
        warn!("设置文件权限失败 {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) {}
