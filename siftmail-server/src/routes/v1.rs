//! Route handlers for the task ingress and learn commands (spec §6.1,
//! §6.6's server side of `learn_spam`/`learn_ham`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use siftmail_contracts::Action;
use siftmail_core::cache::scheduler::Scheduler;
use siftmail_core::roll_history::VerdictRecord;
use siftmail_core::scoring::{check_action, Metric, MetricResult};
use siftmail_core::stats::classifier::{learn as learn_classifier, ClassifierDef};
use siftmail_core::stats::tokenizer::tokenize_osb;
use siftmail_core::task::{Envelope, Settings, Task};

use crate::app_state::AppState;
use crate::errors::{AppError, AppResult};

pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/check", post(check))
        .route("/symbols", post(symbols))
        .route("/report", post(report))
        .route("/report_ifspam", post(report_ifspam))
        .route("/process", post(check))
        .route("/learn/spam", post(learn_spam))
        .route("/learn/ham", post(learn_ham))
        .route("/uptime", get(uptime))
        .route("/counters", get(counters))
        .route("/stat", get(stat))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "pong": true }))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn envelope_from_headers(headers: &HeaderMap) -> Envelope {
    let recipients = headers
        .get_all("Rcpt")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    Envelope {
        from_ip: header_str(headers, "IP").and_then(|s| s.parse::<IpAddr>().ok()),
        helo: header_str(headers, "Helo"),
        hostname: header_str(headers, "Hostname"),
        mail_from: header_str(headers, "From"),
        recipients,
        authenticated_user: header_str(headers, "User"),
        deliver_to: header_str(headers, "Deliver-To"),
        queue_id: header_str(headers, "Queue-Id"),
        subject: header_str(headers, "Subject"),
        pass_all: header_str(headers, "Pass").map(|v| v.eq_ignore_ascii_case("all")).unwrap_or(false),
    }
}

/// Decodes the `Settings` header (spec §6.4): a JSON object overriding
/// symbol weights, forcing an action, or selecting a non-default metric for
/// this task. Absent or malformed header falls back to the defaults.
fn settings_from_headers(headers: &HeaderMap) -> Settings {
    header_str(headers, "Settings")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct SymbolView {
    name: String,
    score: f64,
    options: Vec<String>,
}

#[derive(Serialize)]
struct MetricView {
    score: f64,
    required_score: f64,
    action: Action,
    symbols: Vec<SymbolView>,
}

#[derive(Serialize)]
struct ScanResponse {
    metrics: HashMap<String, MetricView>,
}

/// The lowest-severity configured threshold above `NoAction` — the score a
/// message needs to reach before any action at all is taken (spec §6.1
/// response shape: "per-metric {score, required_score, action, symbols[]}").
fn required_score(metric: &Metric) -> f64 {
    let mut least_severe_first = Action::most_severe_first().collect::<Vec<_>>();
    least_severe_first.reverse();
    least_severe_first
        .into_iter()
        .filter(|a| *a != Action::NoAction)
        .map(|a| metric.threshold(a))
        .find(|t| t.is_finite())
        .unwrap_or(f64::INFINITY)
}

fn metric_view(metric: &Metric, result: &MetricResult, action: Action) -> MetricView {
    let symbols = result
        .hits
        .values()
        .map(|hit| SymbolView {
            name: hit.rule_name.clone(),
            score: hit.score,
            options: hit.options.clone(),
        })
        .collect();
    MetricView {
        score: result.score,
        required_score: required_score(metric),
        action,
        symbols,
    }
}

async fn run_scan(
    state: &AppState,
    envelope: Envelope,
    settings: Settings,
    message: Vec<u8>,
) -> AppResult<(String, Metric, MetricResult, Action)> {
    let pass_all = envelope.pass_all;
    let metric_name = settings.metric_override.clone().unwrap_or_else(|| "default".to_string());

    let (mut task, _finalizer) = Task::new(message, envelope);
    task.settings = settings;
    let task = Arc::new(task);

    let mut scheduler = Scheduler::new(&state.worker.symbol_cache);
    scheduler.run(&task, &state.worker, None, pass_all).await;

    let metric = state
        .worker
        .metrics
        .get(&metric_name)
        .ok_or_else(|| AppError::internal(format!("metric {metric_name} is not configured")))?;

    let mut result = task.metric_result(&metric_name);
    let action = check_action(&task, metric, &mut result);
    state.worker.counters.inc_scanned();

    state.roll_history.push(VerdictRecord {
        task_id: task.id,
        metric: metric_name.clone(),
        score: result.score,
        action,
        symbols: result.hits.keys().cloned().collect(),
    });

    Ok((metric_name, metric.clone(), result, action))
}

async fn check(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> AppResult<Response> {
    let envelope = envelope_from_headers(&headers);
    let settings = settings_from_headers(&headers);
    let (metric_name, metric, result, action) = run_scan(&state, envelope, settings, body.to_vec()).await?;
    let mut metrics = HashMap::new();
    metrics.insert(metric_name, metric_view(&metric, &result, action));
    Ok(Json(ScanResponse { metrics }).into_response())
}

async fn symbols(state: State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> AppResult<Response> {
    check(state, headers, body).await
}

async fn report(state: State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> AppResult<Response> {
    check(state, headers, body).await
}

async fn report_ifspam(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> AppResult<Response> {
    let envelope = envelope_from_headers(&headers);
    let settings = settings_from_headers(&headers);
    let (metric_name, metric, result, action) = run_scan(&state, envelope, settings, body.to_vec()).await?;
    if action == Action::NoAction {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let mut metrics = HashMap::new();
    metrics.insert(metric_name, metric_view(&metric, &result, action));
    Ok(Json(ScanResponse { metrics }).into_response())
}

#[derive(Deserialize)]
struct LearnQuery {
    classifier: Option<String>,
}

fn find_classifier<'a>(state: &'a AppState, name: Option<&str>) -> AppResult<&'a ClassifierDef> {
    match name {
        Some(name) => state
            .classifiers
            .iter()
            .map(|c| c.as_ref())
            .find(|c| c.name == name)
            .ok_or_else(|| AppError::bad_request(format!("unknown classifier {name}"))),
        None => state
            .classifiers
            .first()
            .map(|c| c.as_ref())
            .ok_or_else(|| AppError::internal("no classifier configured")),
    }
}

async fn learn(state: &AppState, classifier: Option<String>, is_spam: bool, body: axum::body::Bytes) -> AppResult<Response> {
    let def = find_classifier(state, classifier.as_deref())?;
    let digest = hex::encode(Sha256::digest(&body));
    let text = String::from_utf8_lossy(&body);
    let tokens = tokenize_osb(&text);

    learn_classifier(def, &digest, is_spam, &tokens, &state.learn_caches)
        .await
        .map_err(AppError::from)?;

    Ok(StatusCode::OK.into_response())
}

async fn learn_spam(
    State(state): State<AppState>,
    Query(query): Query<LearnQuery>,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    learn(&state, query.classifier, true, body).await
}

async fn learn_ham(
    State(state): State<AppState>,
    Query(query): Query<LearnQuery>,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    learn(&state, query.classifier, false, body).await
}

#[derive(Serialize)]
struct UptimeResponse {
    uptime_secs: u64,
}

/// Backs the CLI's `uptime` command (spec §6.6).
async fn uptime(State(state): State<AppState>) -> Json<UptimeResponse> {
    Json(UptimeResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct CountersResponse {
    tasks_scanned: u64,
    tasks_timed_out: u64,
    fuzzy_checked: u64,
    fuzzy_found: u64,
    fuzzy_expired: u64,
    roll_history_len: usize,
    classifiers: usize,
}

/// Backs the CLI's `counters` command (spec §6.6): per-worker task counts
/// plus the fuzzy store's per-epoch `checked`/`found` counters (spec §4.5
/// "Check").
async fn counters(State(state): State<AppState>) -> Json<CountersResponse> {
    Json(CountersResponse {
        tasks_scanned: state.worker.counters.tasks_scanned.load(Ordering::Relaxed),
        tasks_timed_out: state.worker.counters.tasks_timed_out.load(Ordering::Relaxed),
        fuzzy_checked: state.fuzzy_store.counters.checked.load(Ordering::Relaxed),
        fuzzy_found: state.fuzzy_store.counters.found.load(Ordering::Relaxed),
        fuzzy_expired: state.fuzzy_store.counters.expired.load(Ordering::Relaxed),
        roll_history_len: state.roll_history.len(),
        classifiers: state.classifiers.len(),
    })
}

#[derive(Deserialize)]
struct StatQuery {
    classifier: Option<String>,
}

#[derive(Serialize)]
struct StatfileStat {
    symbol: String,
    is_spam: bool,
    total_learns: i64,
}

#[derive(Serialize)]
struct StatResponse {
    classifier: String,
    statfiles: Vec<StatfileStat>,
}

/// Backs the CLI's `stat` command (spec §6.6): per-statfile learn-revision
/// counts for one classifier (defaults to the first configured).
async fn stat(State(state): State<AppState>, Query(query): Query<StatQuery>) -> AppResult<Json<StatResponse>> {
    let def = find_classifier(&state, query.classifier.as_deref())?;

    let mut statfiles = Vec::with_capacity(def.statfiles.len());
    for statfile in &def.statfiles {
        let total_learns = statfile.backend.total_learns(&statfile.path).await.map_err(AppError::from)?;
        statfiles.push(StatfileStat {
            symbol: statfile.symbol.clone(),
            is_spam: statfile.is_spam,
            total_learns,
        });
    }

    Ok(Json(StatResponse {
        classifier: def.name.clone(),
        statfiles,
    }))
}
