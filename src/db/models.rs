use serde::Serialize;

/// app_settings 中使用的键
pub mod setting_keys {
    /// 同步根目录，必须与调用时传入的目录一致
    pub const SYNC_PATH: &str = "sync_path";
    /// 索引创建时间
    pub const INSTALL_DATE: &str = "install_date";
    /// 最近一次扫描的世代标记（毫秒时间戳）
    pub const LAST_INDEXED_AT: &str = "last_indexed_at";
}

/// 进程级键值配置
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppSetting {
    pub name: String,
    pub value: Option<String>,
}

/// 索引中的一条文件记录，filename 为相对同步根目录的路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Resource {
    pub id: i64,
    pub filename: String,
    pub size: i64,
    /// 目录为 None
    pub checksum: Option<String>,
    pub is_directory: bool,
    /// 文件修改时间（毫秒）
    pub last_modified: i64,
    pub add_date: i64,
    pub last_synchronized: Option<i64>,
    /// 最近一次观察到该文件的扫描世代
    pub last_indexed_at: Option<i64>,
    pub queued: bool,
    pub in_progress: bool,
    pub times_failed: u32,
}

/// 记录在传输生命周期中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// 目录只创建，不传输
    Directory,
    Queued,
    InProgress,
    Synchronized,
    /// 失败次数达到上限，不再自动重试
    Abandoned,
}

impl Resource {
    pub fn state(&self) -> ResourceState {
        if self.is_directory {
            ResourceState::Directory
        } else if self.in_progress {
            ResourceState::InProgress
        } else if self.queued {
            ResourceState::Queued
        } else if self.times_failed > 0 {
            ResourceState::Abandoned
        } else {
            ResourceState::Synchronized
        }
    }

    /// 远端对象的逻辑 key
    pub fn remote_key(&self) -> &str {
        self.filename.trim_start_matches('/')
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.filename)
    }
}
