use clap::Parser;
use dirsync_lib::cli::Cli;
use dirsync_lib::logging::{LogConfig, SizeRotatingWriter};
use dirsync_lib::{AppContext, ConfigError, Settings, SyncReport};
use std::process::ExitCode;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 初始化日志系统
fn init_logging(cli: &Cli, config: &LogConfig) {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let sqlx_directive = if cli.verbose { "sqlx=debug" } else { "sqlx=warn" };

    let mut env_filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in [sqlx_directive, "hyper=warn", "opendal=warn"] {
        if let Ok(d) = directive.parse::<Directive>() {
            env_filter = env_filter.add_directive(d);
        }
    }

    if let Some(path) = &cli.log_path {
        match SizeRotatingWriter::new(path, config.max_size_mb) {
            Ok(file_writer) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false);
                let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
                return;
            }
            // 文件日志创建失败，回退到控制台
            Err(e) => eprintln!("无法打开日志文件 {:?}: {}", path, e),
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let subscriber = tracing_subscriber::registry().with(env_filter).with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run(cli: &Cli, settings: Settings) -> anyhow::Result<SyncReport> {
    let sync_root = std::path::absolute(&cli.sync_root)?;
    let ctx = AppContext::new(settings, &sync_root, cli.direction(), cli.flush).await?;
    let report = match ctx.engine() {
        Ok(engine) => engine.run(cli.direction()).await,
        Err(e) => Err(e),
    };
    ctx.close().await;
    report
}

fn print_summary(report: &SyncReport) {
    println!(
        "{}: 扫描 {}, 传输 {}, 删除 {}, 耗时 {}s",
        report.direction,
        report.files_scanned,
        report.files_transferred,
        report.files_deleted,
        report.duration
    );
    if !report.failed.is_empty() {
        println!("以下 {} 个文件同步失败:", report.failed.len());
        for name in &report.failed {
            println!("  {}", name);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    init_logging(&cli, &settings.log);

    match run(&cli, settings).await {
        Ok(report) => {
            print_summary(&report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!("同步失败: {:#}", e);
            eprintln!("{:#}", e);
            if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
