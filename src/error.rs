//! 错误类型
//!
//! 普通的 IO / 数据库错误统一走 `anyhow`，这里只放调用方需要区分处理的错误。

use std::path::PathBuf;
use thiserror::Error;

/// 配置错误：全部是致命错误，在任何传输开始前终止运行
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("未找到配置文件")]
    NotFound,

    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("配置文件格式错误 {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("配置无效: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("同步目录 '{given}' 与索引中记录的目录 '{stored}' 不一致")]
    RootMismatch { given: String, stored: String },

    #[error("参数冲突: {0}")]
    ConflictingOptions(String),
}

/// 传输错误
#[derive(Error, Debug)]
pub enum TransferError {
    /// 上传后远端摘要与本地不一致
    #[error("传输不完整: {key}")]
    IncompleteTransmission { key: String },

    #[error("远端对象不存在: {key}")]
    RemoteFileNotFound { key: String },

    #[error("分块大小必须大于 0")]
    InvalidChunkSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_lists_every_problem() {
        let e = ConfigError::Invalid(vec!["remote.bucket 缺失".into(), "maxThreads 必须大于 0".into()]);
        let msg = e.to_string();
        assert!(msg.contains("remote.bucket"));
        assert!(msg.contains("maxThreads"));
    }

    #[test]
    fn test_transfer_error_mentions_key() {
        let e = TransferError::RemoteFileNotFound { key: "a/b.txt".into() };
        assert!(e.to_string().contains("a/b.txt"));
    }
}
