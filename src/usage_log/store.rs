//! 用量日志存储和异步写入服务

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::Type;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::model::{ModelUsage, TimeSeriesPoint, Timeframe, UsageLogEntry, UsageStats};
use crate::usage::UsageRecord;

/// `recent` 查询上限
pub const MAX_RECENT_LIMIT: u32 = 500;

const CHANNEL_CAPACITY: usize = 10_000;
const MAX_BATCH: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    api_type TEXT NOT NULL,
    model TEXT NOT NULL DEFAULT '',
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    source_app TEXT NOT NULL DEFAULT '',
    estimated_cost REAL
);
CREATE INDEX IF NOT EXISTS idx_usage_created ON usage_records(created_at);
CREATE INDEX IF NOT EXISTS idx_usage_model_created ON usage_records(model, created_at);
CREATE INDEX IF NOT EXISTS idx_usage_api_type_created ON usage_records(api_type, created_at);
";

/// 定宽 RFC3339（纳秒、`Z` 结尾），字典序即时间序
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// 时间窗口对应的 WHERE 子句和参数
fn window_filter(window: Timeframe, now: DateTime<Utc>) -> (&'static str, Vec<String>) {
    match window.duration() {
        Some(duration) => (
            "WHERE created_at >= ?1 AND created_at <= ?2",
            vec![format_timestamp(&(now - duration)), format_timestamp(&now)],
        ),
        None => ("", Vec::new()),
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

/// 底层 SQLite 存储（同步）
struct UsageStore {
    conn: Mutex<Connection>,
}

impl UsageStore {
    fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库失败: {}", db_path.display()))?;
        conn.execute_batch(SCHEMA).context("初始化数据库表失败")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert_batch(&self, records: &[UsageRecord]) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO usage_records (request_id, api_type, model, input_tokens, output_tokens,
                    cache_creation_tokens, cache_read_tokens, latency_ms, status_code, created_at,
                    source_app, estimated_cost)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for record in records {
                stmt.execute(rusqlite::params![
                    record.request_id,
                    record.api_type.as_str(),
                    record.model,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cache_creation_tokens as i64,
                    record.cache_read_tokens as i64,
                    record.latency_ms as i64,
                    record.status_code as i64,
                    format_timestamp(&record.created_at),
                    record.source_app,
                    record.estimated_cost,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn recent(&self, limit: u32) -> Result<Vec<UsageLogEntry>> {
        let limit = limit.clamp(1, MAX_RECENT_LIMIT);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, api_type, model, input_tokens, output_tokens,
                    cache_creation_tokens, cache_read_tokens, latency_ms, status_code,
                    created_at, source_app, estimated_cost
             FROM usage_records ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], |row| {
                let api_type: String = row.get(2)?;
                let created_at: String = row.get(10)?;
                Ok(UsageLogEntry {
                    id: row.get(0)?,
                    record: UsageRecord {
                        request_id: row.get(1)?,
                        api_type: api_type.parse().map_err(|e| conversion_error(2, e))?,
                        model: row.get(3)?,
                        input_tokens: row.get::<_, i64>(4)? as u64,
                        output_tokens: row.get::<_, i64>(5)? as u64,
                        cache_creation_tokens: row.get::<_, i64>(6)? as u64,
                        cache_read_tokens: row.get::<_, i64>(7)? as u64,
                        latency_ms: row.get::<_, i64>(8)? as u64,
                        status_code: row.get::<_, i64>(9)? as u16,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map_err(|e| conversion_error(10, e))?
                            .with_timezone(&Utc),
                        source_app: row.get(11)?,
                        estimated_cost: row.get(12)?,
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn stats(&self, window: Timeframe, now: DateTime<Utc>) -> Result<UsageStats> {
        let (where_sql, params) = window_filter(window, now);
        let conn = self.conn.lock();

        let totals_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                    COALESCE(SUM(estimated_cost), 0.0)
             FROM usage_records {}",
            where_sql
        );
        let mut stats = conn.query_row(
            &totals_sql,
            rusqlite::params_from_iter(params.iter()),
            |row| {
                Ok(UsageStats {
                    timeframe: window.to_string(),
                    total_requests: row.get::<_, i64>(0)? as u64,
                    total_input_tokens: row.get::<_, i64>(1)? as u64,
                    total_output_tokens: row.get::<_, i64>(2)? as u64,
                    total_cache_creation_tokens: row.get::<_, i64>(3)? as u64,
                    total_cache_read_tokens: row.get::<_, i64>(4)? as u64,
                    total_estimated_cost: row.get(5)?,
                    models: Vec::new(),
                })
            },
        )?;

        let models_sql = format!(
            "SELECT model, COUNT(*) AS requests, COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0), COALESCE(SUM(estimated_cost), 0.0) AS cost
             FROM usage_records {}
             GROUP BY model ORDER BY cost DESC, requests DESC, model ASC",
            where_sql
        );
        let mut stmt = conn.prepare(&models_sql)?;
        stats.models = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(ModelUsage {
                    model: row.get(0)?,
                    requests: row.get::<_, i64>(1)? as u64,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    cost: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(stats)
    }

    fn time_series(&self, window: Timeframe, now: DateTime<Utc>) -> Result<Vec<TimeSeriesPoint>> {
        let (where_sql, params) = window_filter(window, now);
        let conn = self.conn.lock();
        // 前 16 个字符即 `YYYY-MM-DDTHH:MM`
        let sql = format!(
            "SELECT substr(created_at, 1, 16) AS bucket, COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0), COUNT(*)
             FROM usage_records {}
             GROUP BY bucket ORDER BY bucket ASC",
            where_sql
        );
        let mut stmt = conn.prepare(&sql)?;
        let points = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                Ok(TimeSeriesPoint {
                    bucket: row.get(0)?,
                    input_tokens: row.get::<_, i64>(1)? as u64,
                    output_tokens: row.get::<_, i64>(2)? as u64,
                    requests: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(points)
    }

    fn reset(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count = conn.execute("DELETE FROM usage_records", [])?;
        Ok(count as u64)
    }
}

enum WriteCommand {
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// 异步用量日志服务（公开 API）
///
/// 写入经 channel 交给后台任务批量落盘，调用方从不等待磁盘 I/O
pub struct UsageLog {
    sender: mpsc::Sender<WriteCommand>,
    store: Arc<UsageStore>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl UsageLog {
    /// 打开（或创建）数据库，启动后台写入任务
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Arc::new(UsageStore::open(db_path.as_ref())?);
        let (sender, receiver) = mpsc::channel::<WriteCommand>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(Self::write_loop(store.clone(), receiver));

        Ok(Self {
            sender,
            store,
            writer: Mutex::new(Some(writer)),
        })
    }

    async fn write_loop(store: Arc<UsageStore>, mut receiver: mpsc::Receiver<WriteCommand>) {
        let mut shutdown = false;
        while let Some(first) = receiver.recv().await {
            let mut batch = Vec::new();
            let mut waiters = Vec::new();
            let mut next = Some(first);
            while let Some(command) = next.take() {
                match command {
                    WriteCommand::Record(record) => batch.push(record),
                    WriteCommand::Flush(waiter) => waiters.push(waiter),
                    WriteCommand::Shutdown => {
                        shutdown = true;
                        break;
                    }
                }
                if batch.len() < MAX_BATCH {
                    next = receiver.try_recv().ok();
                }
            }

            if !batch.is_empty() {
                let count = batch.len();
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await {
                    Ok(Ok(())) => tracing::trace!("已写入 {} 条用量记录", count),
                    Ok(Err(e)) => tracing::error!("批量写入用量记录失败（丢弃 {} 条）: {:#}", count, e),
                    Err(e) => tracing::error!("用量写入任务异常: {}", e),
                }
            }
            for waiter in waiters {
                let _ = waiter.send(());
            }
            if shutdown {
                break;
            }
        }
        tracing::debug!("用量日志写入循环已退出");
    }

    /// 非阻塞追加一条记录；失败只记日志
    pub fn append(&self, record: UsageRecord) {
        match self.sender.try_send(WriteCommand::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("用量记录通道已满，丢弃记录");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("用量日志已关闭，丢弃记录");
            }
        }
    }

    /// 等待此前追加的记录全部落盘
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriteCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// 写完剩余记录后停止后台任务，之后的 `append` 会被丢弃
    pub async fn close(&self) {
        self.flush().await;
        let _ = self.sender.send(WriteCommand::Shutdown).await;
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!("等待用量写入任务退出失败: {}", e);
            }
        }
    }

    /// 最近的记录（按创建时间倒序），`limit` 限制在 [1, 500]
    pub async fn recent(&self, limit: u32) -> Result<Vec<UsageLogEntry>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.recent(limit)).await?
    }

    /// 窗口内汇总统计
    pub async fn stats(&self, window: Timeframe) -> Result<UsageStats> {
        let store = self.store.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || store.stats(window, now)).await?
    }

    /// 窗口内分钟粒度时间序列
    pub async fn time_series(&self, window: Timeframe) -> Result<Vec<TimeSeriesPoint>> {
        let store = self.store.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || store.time_series(window, now)).await?
    }

    /// 清空全部记录，返回删除条数
    pub async fn reset(&self) -> Result<u64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.reset()).await?
    }
}
