//! 分块传输 - 大文件按固定大小切分为多个顺序命名的远端对象
//!
//! 小于等于 `chunk_size` 的文件以单个对象存储在逻辑 key 下；更大的文件存储为
//! `<key>.00000001`、`<key>.00000002` ...，序号从 1 开始，下载时读到第一个
//! 缺失的序号为止。每次写入后都会对比远端摘要与本地 MD5。

use crate::core::file_state::calculate_md5;
use crate::error::TransferError;
use crate::storage::RemoteStore;
use anyhow::Result;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 分块序号宽度
const PART_WIDTH: usize = 8;

/// 远端对象的存储形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Single,
    Multipart,
    Missing,
}

/// 分块 key：`<key>.<8 位序号>`
pub fn part_key(key: &str, seq: u32) -> String {
    format!("{}.{:0width$}", key, seq, width = PART_WIDTH)
}

/// 是否为 key 的某个分块
fn is_part_of(candidate: &str, key: &str) -> bool {
    candidate
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|seq| seq.len() == PART_WIDTH && seq.bytes().all(|b| b.is_ascii_digit()))
}

/// 从源文件读取下一块到临时文件，源文件读完时返回 None
fn stage_chunk(mut source: File, chunk_size: u64) -> io::Result<(File, Option<NamedTempFile>)> {
    let mut staged = NamedTempFile::new()?;
    let copied = io::copy(&mut (&mut source).take(chunk_size), &mut staged)?;
    if copied == 0 {
        return Ok((source, None));
    }
    Ok((source, Some(staged)))
}

/// 分块传输器
#[derive(Clone)]
pub struct ChunkedTransfer {
    store: Arc<dyn RemoteStore>,
    chunk_size: u64,
}

impl ChunkedTransfer {
    pub fn new(store: Arc<dyn RemoteStore>, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self { store, chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// 按 key 名排好序的分块列表
    async fn list_parts(&self, key: &str) -> Result<Vec<String>> {
        let mut parts: Vec<String> = self
            .store
            .list_prefix(&format!("{}.", key))
            .await?
            .into_iter()
            .filter(|candidate| is_part_of(candidate, key))
            .collect();
        parts.sort();
        Ok(parts)
    }

    /// 判断远端对象的存储形式
    pub async fn layout(&self, key: &str) -> Result<Layout> {
        if self.store.exists(key).await? {
            Ok(Layout::Single)
        } else if self.store.exists(&part_key(key, 1)).await? {
            Ok(Layout::Multipart)
        } else {
            Ok(Layout::Missing)
        }
    }

    /// 写入单个对象并校验远端摘要
    async fn put_verified(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let expected = calculate_md5(&data);
        self.store.write(key, data).await?;

        match self.store.digest(key).await? {
            Some(actual) if actual.eq_ignore_ascii_case(&expected) => Ok(()),
            actual => {
                warn!("摘要不一致: {} (本地 {}, 远端 {:?})", key, expected, actual);
                Err(TransferError::IncompleteTransmission {
                    key: key.to_string(),
                }
                .into())
            }
        }
    }

    /// 删除上一次写入残留的对象，`keep_bare` 为 false 时连同单对象一起删除
    async fn remove_stale(&self, key: &str, keep_bare: bool) -> Result<()> {
        for part in self.list_parts(key).await? {
            self.store.delete(&part).await?;
        }
        if !keep_bare && self.store.exists(key).await? {
            self.store.delete(key).await?;
        }
        Ok(())
    }

    /// 上传本地文件到 key
    pub async fn write(&self, local_path: &Path, key: &str) -> Result<()> {
        let size = tokio::fs::metadata(local_path).await?.len();

        if size <= self.chunk_size {
            let data = tokio::fs::read(local_path).await?;
            self.put_verified(key, data).await?;
            // 没有第 1 块就不是分块布局，省掉一次列举
            if self.store.exists(&part_key(key, 1)).await? {
                self.remove_stale(key, true).await?;
            }
            debug!("上传完成: {} ({} bytes)", key, size);
            return Ok(());
        }

        self.remove_stale(key, false).await?;

        let chunk_size = self.chunk_size;
        let mut source = File::open(local_path)?;
        let mut seq = 1u32;
        loop {
            let (returned, staged) =
                tokio::task::spawn_blocking(move || stage_chunk(source, chunk_size)).await??;
            source = returned;
            let Some(staged) = staged else {
                break;
            };

            let data = tokio::fs::read(staged.path()).await?;
            self.put_verified(&part_key(key, seq), data).await?;
            seq += 1;
        }

        debug!("分块上传完成: {} ({} bytes, {} 块)", key, size, seq - 1);
        Ok(())
    }

    /// 下载 key 到本地路径
    ///
    /// 分块对象的读取错误只记录日志，本地文件保持不完整，由调用方的同步检查发现并重试。
    pub async fn copy(&self, key: &str, local_path: &Path) -> Result<()> {
        let layout = self.layout(key).await?;
        if layout == Layout::Missing {
            return Err(TransferError::RemoteFileNotFound {
                key: key.to_string(),
            }
            .into());
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if layout == Layout::Single {
            let data = self.store.read(key).await?;
            tokio::fs::write(local_path, data).await?;
            debug!("下载完成: {}", key);
            return Ok(());
        }

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut seq = 1u32;
        loop {
            let part = part_key(key, seq);
            let data = match self.store.exists(&part).await {
                Ok(false) => break,
                Ok(true) => self.store.read(&part).await,
                Err(e) => Err(e),
            };
            match data {
                Ok(data) => file.write_all(&data).await?,
                Err(e) => {
                    warn!("读取分块失败 {}: {}", part, e);
                    break;
                }
            }
            seq += 1;
        }
        file.flush().await?;

        debug!("分块下载完成: {} ({} 块)", key, seq - 1);
        Ok(())
    }

    /// 删除 key 对应的全部远端对象，全部删除成功时返回 true，远端本就没有对象时返回 false
    pub async fn delete(&self, key: &str) -> bool {
        match self.layout(key).await {
            Ok(Layout::Missing) => {
                debug!("远端对象不存在: {}", key);
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("检查远端对象失败 {}: {}", key, e);
                return false;
            }
        }

        let parts = match self.list_parts(key).await {
            Ok(parts) => parts,
            Err(e) => {
                warn!("列出分块失败 {}: {}", key, e);
                return false;
            }
        };

        let targets = if parts.is_empty() {
            vec![key.to_string()]
        } else {
            parts
        };

        let mut all_ok = true;
        for target in &targets {
            if let Err(e) = self.store.delete(target).await {
                warn!("删除远端对象失败 {}: {}", target, e);
                all_ok = false;
            }
        }
        all_ok
    }
}
