//! 用量日志查询模型

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::Serialize;

use crate::usage::UsageRecord;

/// 统计时间窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeframe {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    All,
}

impl Timeframe {
    pub const VALUES: [Timeframe; 5] = [Self::Hour, Self::Day, Self::Week, Self::Month, Self::All];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "1h",
            Self::Day => "24h",
            Self::Week => "7d",
            Self::Month => "30d",
            Self::All => "all",
        }
    }

    /// 窗口长度；`All` 不设下界
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Hour => Some(Duration::hours(1)),
            Self::Day => Some(Duration::hours(24)),
            Self::Week => Some(Duration::days(7)),
            Self::Month => Some(Duration::days(30)),
            Self::All => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VALUES
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("无效的 timeframe: {}（可选值: 1h, 24h, 7d, 30d, all）", s))
    }
}

/// 已持久化的记录（带自增 ID）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageLogEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: UsageRecord,
}

/// 窗口内汇总统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub timeframe: String,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_creation_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_estimated_cost: f64,
    /// 按费用降序
    pub models: Vec<ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// 分钟粒度时间序列点（无记录的分钟不出现）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    /// `YYYY-MM-DDTHH:MM`（UTC）
    pub bucket: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parse() {
        for tf in Timeframe::VALUES {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2h".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::default(), Timeframe::Day);
        assert_eq!(Timeframe::All.duration(), None);
        assert_eq!(Timeframe::Week.duration(), Some(Duration::days(7)));
    }
}
