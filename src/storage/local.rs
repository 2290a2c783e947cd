use super::{parent_dir, RemoteStore};
use crate::core::file_state::md5_file;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 以本地目录作为远端集合，key 即目录下以 `/` 分隔的相对路径
pub struct LocalStorage {
    root: PathBuf,
    label: String,
}

impl LocalStorage {
    pub fn new(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("无法创建存储目录: {:?}", path))?;
        Ok(Self {
            root: path.to_path_buf(),
            label: format!("local:{}", path.display()),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        match key.trim_start_matches(['/', '\\']) {
            "" => self.root.clone(),
            key => self.root.join(key),
        }
    }
}

#[async_trait]
impl RemoteStore for LocalStorage {
    async fn exists(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("stat 失败: {}", key)),
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.object_path(key))
            .await
            .with_context(|| format!("读取失败: {}", key))
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let target = self.object_path(key);
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        // 先写到同目录下的临时文件再改名，读者不会看到写了一半的对象
        let mut staging = target.clone().into_os_string();
        staging.push(".dirsync-tmp");
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("写入失败: {}", key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("删除失败: {}", key))
            }
            _ => Ok(()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();

        // 与 S3 一致，只列出 prefix 所在的那一层
        let dir = match parent_dir(&prefix) {
            "/" => root.clone(),
            parent => root.join(parent),
        };

        let keys = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .min_depth(1)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .flatten()
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(&root).ok()?.to_str()?;
                    Some(relative.replace('\\', "/"))
                })
                .filter(|key| key.starts_with(&prefix))
                .collect::<Vec<_>>()
        })
        .await?;

        Ok(keys)
    }

    async fn digest(&self, key: &str) -> Result<Option<String>> {
        if !self.exists(key).await? {
            return Ok(None);
        }
        let path = self.object_path(key);
        let digest = tokio::task::spawn_blocking(move || md5_file(&path)).await??;
        Ok(Some(digest))
    }

    fn name(&self) -> &str {
        &self.label
    }
}
