//! 文件状态 - 内容哈希与本地同步状态判断

use crate::db::Resource;
use anyhow::Result;
use md5::{Digest, Md5};
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// 计算内容的 hash（BLAKE3，取前 16 字节）
pub fn calculate_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    // 只取前 16 字节（32 个十六进制字符），足够检测变化
    hash.to_hex()[..32].to_string()
}

/// 流式计算文件 hash，结果与 [`calculate_hash`] 一致
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex()[..32].to_string())
}

/// 在阻塞线程池中计算文件 hash
pub async fn hash_file_async(path: PathBuf) -> Result<String> {
    Ok(tokio::task::spawn_blocking(move || hash_file(&path)).await??)
}

/// 计算 MD5（与对象存储的 ETag 对比用）
pub fn calculate_md5(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// 流式计算文件 MD5
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// 文件修改时间（毫秒时间戳），无法获取时为 0
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 本地文件是否与索引记录一致
///
/// 目录总是视为已同步；排队中或正在传输的记录视为未稳定。
pub async fn is_synchronized(resource: &Resource, local_path: &Path) -> Result<bool> {
    if resource.is_directory {
        return Ok(true);
    }

    match tokio::fs::metadata(local_path).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    if resource.in_progress || resource.queued {
        return Ok(false);
    }

    let Some(expected) = resource.checksum.as_deref() else {
        return Ok(false);
    };

    let actual = hash_file_async(local_path.to_path_buf()).await?;
    Ok(actual == expected)
}
