use super::{parent_dir, RemoteStore, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use opendal::layers::TimeoutLayer;
use opendal::services::S3;
use opendal::{ErrorKind, Operator};
use std::time::Duration;

/// S3 兼容的对象存储
pub struct S3Storage {
    op: Operator,
    label: String,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        let mut builder = S3::default()
            .bucket(&config.bucket)
            .region(&config.region)
            .access_key_id(&config.access_key)
            .secret_access_key(&config.secret_key);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(prefix) = &config.prefix {
            builder = builder.root(prefix);
        }

        let timeouts = TimeoutLayer::default()
            .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS));
        let op = Operator::new(builder)
            .with_context(|| format!("无法创建 S3 连接: {}", config.bucket))?
            .layer(timeouts)
            .finish();

        let label = match config.prefix.as_deref() {
            Some(prefix) => format!("s3://{}/{}", config.bucket, prefix.trim_matches('/')),
            None => format!("s3://{}", config.bucket),
        };

        Ok(Self { op, label })
    }

    /// stat 一个对象，不存在时返回 None
    async fn stat_object(&self, key: &str) -> Result<Option<opendal::Metadata>> {
        match self.op.stat(key).await {
            Ok(meta) if meta.is_dir() => Ok(None),
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("stat 失败: {}", key)),
        }
    }
}

#[async_trait]
impl RemoteStore for S3Storage {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat_object(key).await?.is_some())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let buffer = self
            .op
            .read(key)
            .await
            .with_context(|| format!("读取失败: {}", key))?;
        Ok(buffer.to_vec())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.op
            .write(key, data)
            .await
            .with_context(|| format!("写入失败: {}", key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // 对象不存在时 S3 同样返回成功
        self.op
            .delete(key)
            .await
            .with_context(|| format!("删除失败: {}", key))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // 只列出 prefix 所在的那一层，分块和逻辑对象总在同一目录下
        let entries = self.op.list(parent_dir(prefix)).await?;

        let keys = entries
            .into_iter()
            .filter(|entry| !entry.metadata().is_dir())
            .map(|entry| entry.path().trim_start_matches('/').to_string())
            .filter(|key| key.starts_with(prefix))
            .collect();
        Ok(keys)
    }

    async fn digest(&self, key: &str) -> Result<Option<String>> {
        // 单次 PUT 上传的对象 ETag 即内容 MD5
        let etag = self
            .stat_object(key)
            .await?
            .and_then(|meta| meta.etag().map(|tag| tag.trim_matches('"').to_ascii_lowercase()));
        Ok(etag)
    }

    fn name(&self) -> &str {
        &self.label
    }
}
