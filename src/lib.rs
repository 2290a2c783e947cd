use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::Settings;
pub use core::{SyncConfig, SyncDirection, SyncEngine, SyncReport};
pub use error::{ConfigError, TransferError};

use crate::core::ResourceIndex;
use crate::storage::RemoteStore;

/// 一次运行所需的全部状态，启动时构造一次，显式传给各组件
pub struct AppContext {
    pub settings: Settings,
    pub sync_root: PathBuf,
    pub index: ResourceIndex,
    pub store: Arc<dyn RemoteStore>,
}

impl AppContext {
    /// 打开索引并连接远端存储
    ///
    /// 上传时同步目录必须与索引中记录的一致；`flush` 会清空索引并重新记录目录。
    pub async fn new(
        settings: Settings,
        sync_root: &Path,
        direction: SyncDirection,
        flush: bool,
    ) -> Result<Self> {
        if flush && direction == SyncDirection::Pull {
            return Err(ConfigError::ConflictingOptions(
                "--copy 不能与 --flush 同时使用".to_string(),
            )
            .into());
        }

        let root_str = sync_root
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("同步目录不是有效的 UTF-8 路径: {:?}", sync_root))?;

        let db = db::connect(&settings.index_path).await?;
        let index = ResourceIndex::new(Arc::new(db));
        index.setup(root_str, flush).await?;

        if direction == SyncDirection::Push {
            let stored = index.sync_path().await?.unwrap_or_default();
            if stored != root_str {
                return Err(ConfigError::RootMismatch {
                    given: root_str.to_string(),
                    stored,
                }
                .into());
            }
        }

        let store = storage::create_storage(&settings.remote).await?;

        Ok(Self {
            settings,
            sync_root: sync_root.to_path_buf(),
            index,
            store,
        })
    }

    pub fn engine(&self) -> Result<SyncEngine> {
        SyncEngine::new(
            self.index.clone(),
            self.store.clone(),
            self.sync_root.clone(),
            SyncConfig::from_settings(&self.settings),
        )
    }

    /// 关闭数据库连接池
    pub async fn close(&self) {
        tracing::debug!("关闭数据库连接池...");
        self.index.db().close().await;
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
