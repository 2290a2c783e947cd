use crate::core::SyncDirection;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dirsync", version, about = "将本地目录同步到对象存储")]
pub struct Cli {
    /// 同步根目录
    #[arg(value_name = "SYNC_ROOT")]
    pub sync_root: PathBuf,

    /// 配置文件路径
    #[arg(short = 's', long)]
    pub settings: Option<PathBuf>,

    /// 日志文件路径（默认输出到 stderr）
    #[arg(short = 'l', long)]
    pub log_path: Option<PathBuf>,

    /// 输出 DEBUG 级别日志
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// 额外输出数据库语句日志
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// 清空并重建索引
    #[arg(long)]
    pub flush: bool,

    /// 从远端下载到同步目录（默认为上传）
    #[arg(short = 'c', long)]
    pub copy: bool,
}

impl Cli {
    pub fn direction(&self) -> SyncDirection {
        if self.copy {
            SyncDirection::Pull
        } else {
            SyncDirection::Push
        }
    }
}
