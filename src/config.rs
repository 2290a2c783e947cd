//! 应用配置模块
//!
//! 配置文件为 JSON。所有字段先按可缺省的原始形式读入，再一次性校验，
//! 校验失败时返回包含全部问题的 [`ConfigError::Invalid`]。

use crate::error::ConfigError;
use crate::logging::LogConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// 默认配置文件名
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// 默认分块大小 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 每批处理的索引记录数
pub const DEFAULT_BATCH_SIZE: u32 = 100;

const DEFAULT_MAX_THREADS: i64 = 4;
const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// 远端存储配置（原始形式）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRemoteConfig {
    #[serde(rename = "type")]
    typ: Option<String>,
    path: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    endpoint: Option<String>,
    prefix: Option<String>,
}

/// 配置文件的原始形式
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    remote: Option<RawRemoteConfig>,
    max_threads: Option<i64>,
    max_upload_attempts: Option<i64>,
    max_download_attempts: Option<i64>,
    chunk_size: Option<i64>,
    batch_size: Option<i64>,
    index_path: Option<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default)]
    include_directories: bool,
    #[serde(default)]
    log: LogConfig,
}

/// S3 兼容存储的连接参数
#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// 自定义 endpoint（MinIO 等）
    pub endpoint: Option<String>,
    /// bucket 内的根路径
    pub prefix: Option<String>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("secret_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// 远端存储配置
#[derive(Debug, Clone)]
pub enum RemoteConfig {
    /// 以本地目录作为远端集合
    Local { path: PathBuf },
    S3(S3Config),
}

/// 校验后的配置
#[derive(Debug, Clone)]
pub struct Settings {
    pub remote: RemoteConfig,
    pub max_threads: usize,
    pub max_upload_attempts: u32,
    pub max_download_attempts: u32,
    pub chunk_size: u64,
    pub batch_size: u32,
    pub index_path: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub include_directories: bool,
    pub log: LogConfig,
}

impl Settings {
    /// 定位并加载配置文件
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = find_settings_file(explicit).ok_or(ConfigError::NotFound)?;
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("加载配置文件: {:?}", path);
        Self::from_json(&content, &path)
    }

    /// 从 JSON 文本解析并校验
    pub fn from_json(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawSettings = serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let remote = match raw.remote {
            Some(remote) => validate_remote(remote, &mut errors),
            None => {
                errors.push("remote 缺失".to_string());
                None
            }
        };

        let max_threads = positive(&mut errors, "maxThreads", raw.max_threads, DEFAULT_MAX_THREADS);
        let max_upload_attempts = positive(
            &mut errors,
            "maxUploadAttempts",
            raw.max_upload_attempts,
            DEFAULT_MAX_ATTEMPTS,
        );
        let max_download_attempts = positive(
            &mut errors,
            "maxDownloadAttempts",
            raw.max_download_attempts,
            DEFAULT_MAX_ATTEMPTS,
        );
        let chunk_size = positive(&mut errors, "chunkSize", raw.chunk_size, DEFAULT_CHUNK_SIZE as i64);
        let batch_size = positive(&mut errors, "batchSize", raw.batch_size, DEFAULT_BATCH_SIZE as i64);

        for pattern in &raw.exclude_patterns {
            if pattern.trim().is_empty() {
                errors.push("excludePatterns 不能包含空字符串".to_string());
                break;
            }
        }

        let level = raw.log.level.to_lowercase();
        if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
            errors.push(format!("log.level 无效: {}", raw.log.level));
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let Some(remote) = remote else {
            return Err(ConfigError::Invalid(vec!["remote 无效".to_string()]));
        };

        let index_path = raw
            .index_path
            .map(PathBuf::from)
            .unwrap_or_else(default_index_path);

        Ok(Self {
            remote,
            max_threads: max_threads as usize,
            max_upload_attempts: max_upload_attempts as u32,
            max_download_attempts: max_download_attempts as u32,
            chunk_size: chunk_size as u64,
            batch_size: batch_size as u32,
            index_path,
            exclude_patterns: raw.exclude_patterns,
            include_directories: raw.include_directories,
            log: raw.log,
        })
    }
}

fn validate_remote(raw: RawRemoteConfig, errors: &mut Vec<String>) -> Option<RemoteConfig> {
    match raw.typ.as_deref().map(str::to_lowercase).as_deref() {
        Some("local") => {
            let path = require(errors, "path", raw.path)?;
            Some(RemoteConfig::Local {
                path: PathBuf::from(path),
            })
        }
        Some("s3") => {
            // 逐个检查，保证所有缺失字段都被记录
            let bucket = require(errors, "bucket", raw.bucket);
            let region = require(errors, "region", raw.region);
            let access_key = require(errors, "accessKey", raw.access_key);
            let secret_key = require(errors, "secretKey", raw.secret_key);
            Some(RemoteConfig::S3(S3Config {
                bucket: bucket?,
                region: region?,
                access_key: access_key?,
                secret_key: secret_key?,
                endpoint: raw.endpoint.filter(|e| !e.is_empty()),
                prefix: raw.prefix.filter(|p| !p.is_empty()),
            }))
        }
        Some(other) => {
            errors.push(format!("remote.type 不支持: {}", other));
            None
        }
        None => {
            errors.push("remote.type 缺失".to_string());
            None
        }
    }
}

fn require(errors: &mut Vec<String>, name: &str, value: Option<String>) -> Option<String> {
    let value = value.filter(|v| !v.trim().is_empty());
    if value.is_none() {
        errors.push(format!("remote.{} 缺失", name));
    }
    value
}

fn positive(errors: &mut Vec<String>, name: &str, value: Option<i64>, default: i64) -> i64 {
    match value {
        Some(v) if v > 0 => v,
        Some(v) => {
            errors.push(format!("{} 必须大于 0 (当前 {})", name, v));
            default
        }
        None => default,
    }
}

/// 查找配置文件：显式指定的路径优先，否则依次查找用户配置目录和 /etc/dirsync
pub fn find_settings_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let mut candidates = Vec::new();
    if let Some(dir) = crate::dirs::config_dir() {
        candidates.push(dir.join("dirsync").join(SETTINGS_FILE_NAME));
    }
    candidates.push(PathBuf::from("/etc/dirsync").join(SETTINGS_FILE_NAME));

    candidates.into_iter().find(|p| p.is_file())
}

fn default_index_path() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("dirsync"))
        .unwrap_or_else(|| PathBuf::from(".dirsync"))
        .join("index.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Settings, ConfigError> {
        Settings::from_json(json, Path::new("settings.json"))
    }

    #[test]
    fn test_s3_settings_with_defaults() {
        let settings = parse(
            r#"{
                "remote": {
                    "type": "s3",
                    "bucket": "backups",
                    "region": "us-east-1",
                    "accessKey": "AK",
                    "secretKey": "SK"
                },
                "indexPath": "/tmp/index.db"
            }"#,
        )
        .unwrap();

        assert!(matches!(settings.remote, RemoteConfig::S3(ref s3) if s3.bucket == "backups"));
        assert_eq!(settings.max_threads, 4);
        assert_eq!(settings.max_upload_attempts, 3);
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(settings.index_path, PathBuf::from("/tmp/index.db"));
        assert!(settings.exclude_patterns.is_empty());
    }

    #[test]
    fn test_reports_every_invalid_field() {
        let err = parse(
            r#"{
                "remote": { "type": "s3", "bucket": "b" },
                "maxThreads": 0,
                "chunkSize": -1
            }"#,
        )
        .unwrap_err();

        match err {
            ConfigError::Invalid(errors) => {
                let joined = errors.join("\n");
                assert!(joined.contains("remote.region"));
                assert!(joined.contains("remote.accessKey"));
                assert!(joined.contains("remote.secretKey"));
                assert!(joined.contains("maxThreads"));
                assert!(joined.contains("chunkSize"));
                assert_eq!(errors.len(), 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_remote() {
        let err = parse(r#"{ "maxThreads": 2 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref e) if e == &vec!["remote 缺失".to_string()]));
    }

    #[test]
    fn test_local_remote_and_log_section() {
        let settings = parse(
            r#"{
                "remote": { "type": "local", "path": "/srv/mirror" },
                "maxThreads": 8,
                "log": { "level": "debug", "maxSizeMb": 2 }
            }"#,
        )
        .unwrap();

        assert!(matches!(settings.remote, RemoteConfig::Local { ref path } if path == Path::new("/srv/mirror")));
        assert_eq!(settings.max_threads, 8);
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.log.max_size_mb, 2);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(parse("{ not json"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_secret_is_redacted() {
        let settings = parse(
            r#"{ "remote": { "type": "s3", "bucket": "b", "region": "r", "accessKey": "a", "secretKey": "hunter2" } }"#,
        )
        .unwrap();
        assert!(!format!("{:?}", settings.remote).contains("hunter2"));
    }
}
