//! 用量报表 API 处理器

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

use super::model::Timeframe;
use super::router::UsageApiState;

const DEFAULT_RECENT_LIMIT: u32 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct TimeframeQuery {
    pub timeframe: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<String>,
}

fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {"type": error_type, "message": message}
        })),
    )
        .into_response()
}

fn parse_timeframe(query: &TimeframeQuery) -> Result<Timeframe, Response> {
    match query.timeframe.as_deref() {
        None | Some("") => Ok(Timeframe::default()),
        Some(raw) => raw.parse::<Timeframe>().map_err(|e: anyhow::Error| {
            error_response(StatusCode::BAD_REQUEST, "invalid_request_error", e.to_string())
        }),
    }
}

/// 解析 `limit`：必须是正整数，过大的值由存储层收敛到上限
fn parse_limit(query: &RecentQuery) -> Result<u32, Response> {
    let raw = match query.limit.as_deref() {
        None | Some("") => return Ok(DEFAULT_RECENT_LIMIT),
        Some(raw) => raw,
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if n >= 1 => Ok(u32::try_from(n).unwrap_or(u32::MAX)),
        _ => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("limit 必须是正整数: {}", raw),
        )),
    }
}

fn internal_error(context: &str, e: anyhow::Error) -> Response {
    tracing::error!("{}: {:#}", context, e);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        format!("{}: {}", context, e),
    )
}

/// GET /api/stats
pub async fn get_stats(
    State(state): State<UsageApiState>,
    Query(query): Query<TimeframeQuery>,
) -> Response {
    let timeframe = match parse_timeframe(&query) {
        Ok(tf) => tf,
        Err(response) => return response,
    };
    match state.log.stats(timeframe).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error("统计失败", e),
    }
}

/// GET /api/recent
pub async fn get_recent(
    State(state): State<UsageApiState>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = match parse_limit(&query) {
        Ok(limit) => limit,
        Err(response) => return response,
    };
    match state.log.recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error("查询最近记录失败", e),
    }
}

/// GET /api/timeseries
pub async fn get_time_series(
    State(state): State<UsageApiState>,
    Query(query): Query<TimeframeQuery>,
) -> Response {
    let timeframe = match parse_timeframe(&query) {
        Ok(tf) => tf,
        Err(response) => return response,
    };
    match state.log.time_series(timeframe).await {
        Ok(points) => Json(points).into_response(),
        Err(e) => internal_error("查询时间序列失败", e),
    }
}

/// DELETE /api/usage
pub async fn reset_usage(State(state): State<UsageApiState>) -> Response {
    // 先让已排队的记录落盘，再整体清空
    state.log.flush().await;
    match state.log.reset().await {
        Ok(deleted) => {
            tracing::info!("已清除 {} 条用量记录", deleted);
            Json(serde_json::json!({"success": true, "deleted": deleted})).into_response()
        }
        Err(e) => internal_error("清空失败", e),
    }
}
