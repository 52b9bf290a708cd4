use crate::domain::BtcPoint;
use crate::errors::{RateError, RateResult};
use crate::rates::calc_rates;
use crate::storage::{Filter, Op, Storage};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

type Db = Arc<dyn Storage>;

pub fn router(db: Db) -> Router {
    Router::new()
        .route("/api/btcusdt", get(btc_latest).post(btc_history))
        .route("/api/latest", get(cross_latest))
        .route("/api/currencies", get(fiats_latest).post(fiats_history))
        .layer(axum::middleware::from_fn(log_request))
        .layer(tower_http::set_header::SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(db)
}

async fn log_request(request: Request, next: Next) -> Response {
    tracing::info!(
        method = %request.method(),
        path = request.uri().path(),
        query = request.uri().query().unwrap_or(""),
        "rest request"
    );
    next.run(request).await
}

/// `?limit=N&offset=N&date=[gte:|lte:]…&currency=XXX`. History queries are
/// `POST` for parity with the original API, reads or not.
#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    date: Option<String>,
    currency: Option<String>,
}

#[derive(Clone, Copy)]
enum DateLayout {
    /// `YYYY-MM-DDTHH:MM:SS`
    DateTime,
    /// `YYYY-MM-DD`
    Date,
}

/// GET /api/btcusdt — the current BTC/USDT quote.
async fn btc_latest(State(db): State<Db>) -> Response {
    let rows = match query_db(db.btc_rate(&Filter::latest())).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let Some(latest) = rows.first() else {
        return not_found("latest rate is not found");
    };
    Json(BtcPoint {
        timestamp: latest.time,
        value: latest.value,
    })
    .into_response()
}

/// POST /api/btcusdt — BTC/USDT history with a date bound and pagination.
async fn btc_history(State(db): State<Db>, Query(query): Query<HistoryQuery>) -> Response {
    let filter = match build_filter(&query, DateLayout::DateTime) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    let rows = match query_db(db.btc_rate(&filter)).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    if rows.is_empty() {
        return not_found("BTC/USDT history is not found");
    }

    let history: Vec<BtcPoint> = rows
        .iter()
        .map(|r| BtcPoint {
            timestamp: r.time,
            value: r.value,
        })
        .collect();
    Json(json!({ "total": history.len(), "history": history })).into_response()
}

/// GET /api/latest — fiat cross-rates against BTC, same map the push channel
/// ships.
async fn cross_latest(State(db): State<Db>) -> Response {
    let latest = match query_db(db.btc_rate(&Filter::latest())).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let Some(latest) = latest.first() else {
        return internal_error("no BTC/USDT rate yet");
    };

    match query_db(calc_rates(db.as_ref(), latest.value)).await {
        Ok(cross) => Json(cross).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/currencies — the latest fiat-to-RUB sheet.
async fn fiats_latest(State(db): State<Db>) -> Response {
    let rows = match query_db(db.fiats_current()).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    if rows.is_empty() {
        return not_found("latest RUB rates not found");
    }

    let sheet: BTreeMap<String, f64> = rows.into_iter().map(|r| (r.char_code, r.value)).collect();
    Json(sheet).into_response()
}

/// POST /api/currencies — fiat-to-RUB history grouped by day, ascending.
async fn fiats_history(State(db): State<Db>, Query(query): Query<HistoryQuery>) -> Response {
    let filter = match build_filter(&query, DateLayout::Date) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    let rows = match query_db(db.fiats(&filter)).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    if rows.is_empty() {
        return not_found("history RUB rates not found");
    }

    let mut history: Vec<serde_json::Map<String, serde_json::Value>> = Vec::new();
    let mut day = None;
    for row in rows {
        if day != Some(row.time) {
            let mut entry = serde_json::Map::new();
            entry.insert("date".to_string(), json!(format_date(row.time)));
            history.push(entry);
            day = Some(row.time);
        }
        if let Some(entry) = history.last_mut() {
            entry.insert(row.char_code, json!(row.value));
        }
    }

    Json(json!({ "total": history.len(), "history": history })).into_response()
}

// Handlers bound storage work to 5 s; the pipelines run with no inner
// deadline.
async fn query_db<T>(work: impl Future<Output = RateResult<T>>) -> RateResult<T> {
    match tokio::time::timeout(STORAGE_TIMEOUT, work).await {
        Ok(result) => result,
        Err(_) => Err(RateError::Storage("storage deadline exceeded".to_string())),
    }
}

fn build_filter(query: &HistoryQuery, layout: DateLayout) -> Result<Filter, Response> {
    let mut filter = Filter::default();

    if let Some(date) = query.date.as_deref() {
        let Some((time, op)) = parse_time_bound(date, layout) else {
            return Err(bad_request("bad date parameter"));
        };
        filter.time = time;
        filter.op = op;
    }
    if let Some(limit) = query.limit {
        if limit < 0 {
            return Err(bad_request("bad limit parameter"));
        }
        filter.limit = limit;
    }
    if let Some(offset) = query.offset {
        if offset < 0 {
            return Err(bad_request("bad offset parameter"));
        }
        filter.offset = offset;
    }
    filter.currency = query.currency.clone().unwrap_or_default();

    Ok(filter)
}

fn parse_time_bound(raw: &str, layout: DateLayout) -> Option<(i64, Op)> {
    let (op, rest) = if let Some(rest) = raw.strip_prefix("gte:") {
        (Op::Gte, rest)
    } else if let Some(rest) = raw.strip_prefix("lte:") {
        (Op::Lte, rest)
    } else {
        (Op::Eq, raw)
    };

    let timestamp = match layout {
        DateLayout::DateTime => NaiveDateTime::parse_from_str(rest, "%Y-%m-%dT%H:%M:%S")
            .ok()?
            .and_utc()
            .timestamp(),
        DateLayout::Date => NaiveDate::parse_from_str(rest, "%Y-%m-%d")
            .ok()?
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp(),
    };
    Some((timestamp, op))
}

fn format_date(time: i64) -> String {
    DateTime::<Utc>::from_timestamp(time, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn internal_error<E: std::fmt::Display>(e: E) -> Response {
    tracing::error!("db err: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
