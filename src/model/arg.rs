use clap::{Parser, Subcommand};

use crate::usage_log::Timeframe;

/// LLM API 用量计量代理
#[derive(Parser, Debug)]
#[command(name = "tokenwatch", version, about, long_about = None)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别（RUST_LOG 优先）
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// 启动代理和报表 API（默认）
    Serve,
    /// 输出时间窗口内的用量汇总
    Stats {
        /// 1h / 24h / 7d / 30d / all
        #[arg(short, long, default_value = "24h", value_parser = parse_timeframe)]
        timeframe: Timeframe,
    },
    /// 输出最近的请求记录
    Recent {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
    /// 检查代理是否在运行
    Status,
    /// 清空全部用量记录
    Reset {
        /// 确认删除
        #[arg(long)]
        yes: bool,
    },
}

fn parse_timeframe(s: &str) -> Result<Timeframe, String> {
    s.parse::<Timeframe>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let args = Args::try_parse_from(["tokenwatch"]).unwrap();
        assert_eq!(args.command, None);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_stats_timeframe() {
        let args = Args::try_parse_from(["tokenwatch", "stats", "-t", "7d", "--config", "c.json"]).unwrap();
        assert_eq!(args.command, Some(Command::Stats { timeframe: Timeframe::Week }));
        assert_eq!(args.config.as_deref(), Some("c.json"));

        assert!(Args::try_parse_from(["tokenwatch", "stats", "-t", "2h"]).is_err());
    }

    #[test]
    fn test_recent_and_reset() {
        let args = Args::try_parse_from(["tokenwatch", "recent", "-n", "5"]).unwrap();
        assert_eq!(args.command, Some(Command::Recent { limit: 5 }));

        let args = Args::try_parse_from(["tokenwatch", "reset"]).unwrap();
        assert_eq!(args.command, Some(Command::Reset { yes: false }));
    }
}
