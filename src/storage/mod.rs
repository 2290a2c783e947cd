pub mod local;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use local::LocalStorage;
pub use s3::S3Storage;

use crate::config::RemoteConfig;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远端对象存储接口
///
/// key 一律使用 `/` 分隔、不带前导 `/` 的相对路径。实现必须可以被多个
/// worker 并发调用。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 对象是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 读取整个对象
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// 写入整个对象
    async fn write(&self, key: &str, data: Vec<u8>) -> Result<()>;

    /// 删除对象
    async fn delete(&self, key: &str) -> Result<()>;

    /// 列出以 prefix 开头的对象 key，只看 prefix 最后一个 `/` 所在的那一层
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// 对象的内容摘要（与本地 MD5 十六进制字符串可比较），对象不存在时返回 None
    async fn digest(&self, key: &str) -> Result<Option<String>>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建存储实例
pub async fn create_storage(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match config {
        RemoteConfig::Local { path } => {
            tracing::info!("初始化本地存储: {:?}", path);
            Ok(Arc::new(LocalStorage::new(path)?) as Arc<dyn RemoteStore>)
        }
        RemoteConfig::S3(s3) => {
            tracing::info!("初始化S3存储: bucket={}, region={}", s3.bucket, s3.region);
            Ok(Arc::new(S3Storage::new(s3)?) as Arc<dyn RemoteStore>)
        }
    }
}

/// prefix 所在的目录（带结尾 `/`），根目录返回 `/`
pub(crate) fn parent_dir(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(idx) => &prefix[..=idx],
        None => "/",
    }
}
