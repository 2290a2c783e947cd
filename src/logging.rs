//! 日志配置与按大小轮转的日志文件

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// 配置文件中的 `log` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    pub max_size_mb: u32,
    /// error / warn / info / debug / trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 5,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// 无法识别的级别按 INFO 处理
    pub fn tracing_level(&self) -> tracing::Level {
        self.level.trim().parse().unwrap_or(tracing::Level::INFO)
    }
}

/// 当前打开的日志文件及已写入的字节数
struct ActiveLog {
    path: PathBuf,
    limit: u64,
    out: BufWriter<File>,
    written: u64,
}

impl ActiveLog {
    fn open(path: &Path, limit: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        let mut log = Self {
            path: path.to_path_buf(),
            limit,
            out: BufWriter::new(file),
            written,
        };
        if log.written > limit {
            log.rotate()?;
        }
        Ok(log)
    }

    /// `<file>` -> `<file>.old`，旧的备份被覆盖
    fn rotate(&mut self) -> io::Result<()> {
        self.out.flush()?;
        let mut backup = self.path.as_os_str().to_os_string();
        backup.push(".old");
        fs::rename(&self.path, PathBuf::from(backup))?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.out = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.out.flush()?;
        self.written += n as u64;
        if self.written > self.limit {
            self.rotate()?;
        }
        Ok(n)
    }
}

/// 按大小轮转的日志写入器，可直接作为 fmt layer 的 writer
#[derive(Clone)]
pub struct SizeRotatingWriter {
    active: Arc<Mutex<ActiveLog>>,
}

impl SizeRotatingWriter {
    pub fn new(file_path: &Path, max_size_mb: u32) -> io::Result<Self> {
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let limit = u64::from(max_size_mb.max(1)) * 1024 * 1024;
        let active = ActiveLog::open(file_path, limit)?;
        Ok(Self {
            active: Arc::new(Mutex::new(active)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ActiveLog> {
        // 某个线程写日志时 panic 不影响后续写入
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// fmt layer 每条事件获取一次的写入句柄
pub struct LogWriter {
    owner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.owner.lock().append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.owner.lock().out.flush()
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            owner: self.clone(),
        }
    }
}
