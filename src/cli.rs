use clap::{Parser, Subcommand};

impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// ratewarden - 分布式限流与安全监控引擎管理工具
#[derive(Parser, Debug, Default)]
#[command(name = "ratewarden")]
#[command(version)]
#[command(about = "分布式限流、用量统计与安全事件监控", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径（按天滚动）")]
    pub log_file: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串")]
    pub redis_url: Option<String>,

    /// Key 前缀
    #[arg(long, value_name = "PREFIX", help = "Counter Store key 前缀")]
    pub key_prefix: Option<String>,

    /// 存储不可用时的策略
    #[arg(long, value_name = "MODE", help = "存储不可用时: open（放行）, closed（拒绝）")]
    pub fail_mode: Option<String>,

    /// Counter Store 后端
    #[arg(long, value_name = "BACKEND", help = "Counter Store 后端: redis, memory")]
    pub backend: Option<String>,

    /// 启用监控指标
    #[arg(long, help = "启用 Prometheus 监控指标")]
    pub enable_metrics: bool,

    /// 监控端口
    #[arg(long, value_name = "PORT", help = "监控指标服务端口（GET /metrics）")]
    pub metrics_port: Option<u16>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（只输出错误）")]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 生成默认配置文件
    GenerateConfig {
        #[arg(value_name = "PATH", default_value = "ratewarden.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        #[arg(value_name = "PATH", default_value = "ratewarden.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
    /// 执行一次准入检查（会消耗请求配额）
    Check {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
        /// 超限事件的来源 IP
        #[arg(long)]
        ip: Option<String>,
    },
    /// 记录 Token 用量
    Record {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        tokens: u64,
    },
    /// 查看用量快照
    Usage {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// 清空计数器并解除冷却封禁
    Reset {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// 封禁 IP
    Block {
        ip: String,
        #[arg(long, default_value_t = 3600)]
        duration_secs: u64,
        #[arg(long, default_value = "manual block")]
        reason: String,
    },
    /// 解除 IP 封禁
    Unblock { ip: String },
    /// 查询 IP 封禁状态；不指定 IP 时列出当前封禁
    Blocked {
        ip: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// 安全态势汇总
    Metrics {
        #[arg(long, default_value_t = 3600)]
        range_secs: u64,
    },
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        match self.verbose {
            0 => None, // 使用默认或配置文件
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_precedence() {
        let cli = Cli::try_parse_from(["ratewarden", "-vv", "--log-level", "warn"]).unwrap();
        assert_eq!(cli.get_log_level().as_deref(), Some("warn"));

        let cli = Cli::try_parse_from(["ratewarden", "-vv"]).unwrap();
        assert_eq!(cli.get_log_level().as_deref(), Some("debug"));

        let cli = Cli::try_parse_from(["ratewarden", "--dev", "-q"]).unwrap();
        assert_eq!(cli.get_log_level().as_deref(), Some("error"));
        assert_eq!(cli.get_log_format().as_deref(), Some("pretty"));
    }

    #[test]
    fn test_parse_block_command() {
        let cli = Cli::try_parse_from([
            "ratewarden",
            "--backend",
            "memory",
            "block",
            "203.0.113.9",
            "--duration-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(cli.backend.as_deref(), Some("memory"));
        match cli.command {
            Some(Commands::Block {
                ip,
                duration_secs,
                reason,
            }) => {
                assert_eq!(ip, "203.0.113.9");
                assert_eq!(duration_secs, 60);
                assert_eq!(reason, "manual block");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
