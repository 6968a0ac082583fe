use anyhow::{Context, Result};
use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统
///
/// 指定 `log_file` 时额外按天滚动写入文件；返回的 guard 需要保持到进程退出，
/// 否则缓冲中的日志会丢失。
pub fn init_logging(
    log_level: &str,
    log_format: Option<&str>,
    log_file: Option<&str>,
    quiet: bool,
) -> Result<Option<WorkerGuard>> {
    // 如果静默模式，只输出错误
    let level = if quiet { "error" } else { log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match log_format {
        Some("json") => {
            // JSON 格式（适合生产环境）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .with(file_layer(writer))
                .try_init()
        }
        Some("pretty") | Some("dev") => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .with(file_layer(writer))
                .try_init()
        }
        _ => {
            // Compact 格式（默认）
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .with(file_layer(writer))
                .try_init()
        }
    }
    .context("日志系统已初始化")?;

    Ok(guard)
}

/// `./logs/ratewarden.log` -> 目录 `./logs`，文件名前缀 `ratewarden.log`
fn file_writer(path: &str) -> Result<(NonBlocking, WorkerGuard)> {
    let path = Path::new(path);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .with_context(|| format!("无效的日志文件路径: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("无法创建日志目录: {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, prefix);
    Ok(tracing_appender::non_blocking(appender))
}

fn file_layer<S>(
    writer: Option<NonBlocking>,
) -> Option<fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, NonBlocking>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    writer.map(|w| fmt::layer().with_ansi(false).with_writer(w))
}
