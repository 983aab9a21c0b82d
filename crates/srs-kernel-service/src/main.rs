use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use srs_kernel_api::{
    AddCardsRequest, AddCardsResult, AnswerOutcome, CompleteWrongAnswerRequest, CompletionResult,
    CreateFolderRequest, EnrollRequest, NotifyReport, RecalcReport, RollupReport, SrsKernelApi,
    SrsStatusView, SubmitAnswerRequest, TimeStatus, API_CONTRACT_VERSION,
};
use srs_kernel_core::{sweep_cadence, CardId, Clock, FolderId, KernelError, UserId};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

const ALARM_WORKER_TICK: std::time::Duration = std::time::Duration::from_secs(1);
const SUPERVISOR_META_TICK: std::time::Duration = std::time::Duration::from_secs(60);
const NOTIFY_TICK: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);
const ROLLUP_MINUTE_PAST_MIDNIGHT: i64 = 5;

#[derive(Clone)]
struct ServiceState {
    api: SrsKernelApi,
    queue: Arc<AlarmQueue>,
    supervisor: Arc<SweepSupervisor>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Parser)]
#[command(name = "srs-kernel-service")]
#[command(about = "Local HTTP service for the SRS scheduling kernel")]
struct Args {
    #[arg(long, default_value = "./srs_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    let status = match err.downcast_ref::<KernelError>() {
        Some(KernelError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(KernelError::Forbidden(_)) => StatusCode::FORBIDDEN,
        Some(KernelError::Conflict(_)) => StatusCode::CONFLICT,
        Some(KernelError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
        status,
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Delayed folder-notification queue with replace-on-duplicate-key
/// semantics: one pending fire per folder, rescheduling overwrites.
struct AlarmQueue {
    pending: Mutex<HashMap<FolderId, OffsetDateTime>>,
}

impl AlarmQueue {
    fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    fn enqueue(&self, folder_id: FolderId, target: OffsetDateTime) {
        let mut pending =
            self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.insert(folder_id, target);
    }

    /// Remove and return every entry due at `now`.
    fn drain_due(&self, now: OffsetDateTime) -> Vec<(FolderId, OffsetDateTime)> {
        let mut pending =
            self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let due: Vec<(FolderId, OffsetDateTime)> = pending
            .iter()
            .filter(|(_, target)| **target <= now)
            .map(|(folder_id, target)| (*folder_id, *target))
            .collect();
        for (folder_id, _) in &due {
            pending.remove(folder_id);
        }
        due
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

enum SweepState {
    Stopped,
    Running { handle: JoinHandle<()>, cadence: std::time::Duration },
}

/// Supervisor for the dynamic overdue sweep: cancels-and-replaces its own
/// interval task whenever the cadence band for the current acceleration
/// factor changes.
struct SweepSupervisor {
    api: SrsKernelApi,
    state: tokio::sync::Mutex<SweepState>,
}

impl SweepSupervisor {
    fn new(api: SrsKernelApi) -> Self {
        Self { api, state: tokio::sync::Mutex::new(SweepState::Stopped) }
    }

    async fn refresh(&self) {
        let factor = self.api.clock().acceleration_factor();
        let cadence = std::time::Duration::try_from(sweep_cadence(factor))
            .unwrap_or(std::time::Duration::from_secs(600));

        let mut state = self.state.lock().await;
        if let SweepState::Running { cadence: current, .. } = &*state {
            if *current == cadence {
                return;
            }
        }
        if let SweepState::Running { handle, .. } =
            std::mem::replace(&mut *state, SweepState::Stopped)
        {
            handle.abort();
        }

        let api = self.api.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match api.sweep_overdue() {
                    Ok(counts) => {
                        tracing::debug!(
                            promoted = counts.promoted,
                            frozen = counts.frozen,
                            thawed = counts.thawed,
                            "sweep tick"
                        );
                    }
                    Err(err) => tracing::warn!(error = %err, "overdue sweep failed"),
                }
            }
        });
        *state = SweepState::Running { handle, cadence };
        tracing::info!(factor, cadence_secs = cadence.as_secs_f64(), "sweep cadence applied");
    }

    async fn current_cadence(&self) -> Option<std::time::Duration> {
        match &*self.state.lock().await {
            SweepState::Stopped => None,
            SweepState::Running { cadence, .. } => Some(*cadence),
        }
    }
}

/// The three independently-scheduled periodic jobs plus the alarm worker.
fn spawn_periodic_triggers(state: &ServiceState) {
    let supervisor = Arc::clone(&state.supervisor);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUPERVISOR_META_TICK);
        loop {
            ticker.tick().await;
            supervisor.refresh().await;
        }
    });

    let api = state.api.clone();
    let queue = Arc::clone(&state.queue);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(NOTIFY_TICK);
        loop {
            ticker.tick().await;
            match api.six_hourly_notify() {
                Ok(report) => {
                    for alarm in report.refreshed {
                        queue.enqueue(alarm.folder_id, alarm.next_alarm_at);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "six-hourly notify failed"),
            }
        }
    });

    let api = state.api.clone();
    tokio::spawn(async move {
        loop {
            let now = api.clock().now();
            let next = next_rollup_at(now);
            let wait = std::time::Duration::try_from(next - now)
                .unwrap_or(std::time::Duration::from_secs(60));
            tokio::time::sleep(wait).await;
            match api.midnight_rollup() {
                Ok(report) => tracing::info!(
                    users = report.users,
                    zeroed = report.zeroed,
                    "midnight rollup ran"
                ),
                Err(err) => tracing::warn!(error = %err, "midnight rollup failed"),
            }
        }
    });

    let api = state.api.clone();
    let queue = Arc::clone(&state.queue);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ALARM_WORKER_TICK);
        loop {
            ticker.tick().await;
            for (folder_id, target) in queue.drain_due(api.clock().now()) {
                tracing::info!(folder = %folder_id, target = %target, "folder alarm fired");
            }
        }
    });
}

fn next_rollup_at(now: OffsetDateTime) -> OffsetDateTime {
    let next_midnight = (now + time::Duration::days(1)).replace_time(time::Time::MIDNIGHT);
    next_midnight + time::Duration::minutes(ROLLUP_MINUTE_PAST_MIDNIGHT)
}

#[derive(Debug, Clone, Deserialize)]
struct UserQuery {
    user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
struct WrongAnswerQuery {
    user_id: UserId,
    #[serde(default)]
    include_completed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct AddCardsBody {
    user_id: UserId,
    card_ids: Vec<CardId>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnenrollRequest {
    user_id: UserId,
    card_id: CardId,
}

#[derive(Debug, Clone, Serialize)]
struct UnenrollResult {
    removed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SetFactorRequest {
    factor: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct SetOffsetRequest {
    days: i32,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/srs/cards", post(enroll))
        .route("/v1/srs/cards/unenroll", post(unenroll))
        .route("/v1/srs/answer", post(submit_answer))
        .route("/v1/srs/folders", post(create_folder))
        .route("/v1/srs/folders/:folder_id/items", post(add_cards))
        .route("/v1/srs/folders/:folder_id/queue", get(folder_queue))
        .route("/v1/srs/status", get(srs_status))
        .route("/v1/srs/streak", get(streak))
        .route("/v1/srs/wrong-answers", get(wrong_answers))
        .route("/v1/srs/wrong-answers/complete", post(complete_wrong_answer))
        .route("/v1/time/status", get(time_status))
        .route("/v1/time/acceleration", post(set_acceleration))
        .route("/v1/time/offset", post(set_offset))
        .route("/v1/time/reset", post(reset_time))
        .route("/v1/jobs/sweep", post(run_sweep))
        .route("/v1/jobs/notify", post(run_notify))
        .route("/v1/jobs/rollup", post(run_rollup))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let clock = Arc::new(Clock::system());
    let api = SrsKernelApi::new(args.db, clock);
    let state = ServiceState {
        supervisor: Arc::new(SweepSupervisor::new(api.clone())),
        queue: Arc::new(AlarmQueue::new()),
        api,
    };
    state.supervisor.refresh().await;
    spawn_periodic_triggers(&state);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "srs-kernel-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn enroll(
    State(state): State<ServiceState>,
    Json(request): Json<EnrollRequest>,
) -> Result<Json<ServiceEnvelope<Vec<srs_kernel_core::Card>>>, ServiceError> {
    let cards = state.api.enroll(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(cards)))
}

async fn unenroll(
    State(state): State<ServiceState>,
    Json(request): Json<UnenrollRequest>,
) -> Result<Json<ServiceEnvelope<UnenrollResult>>, ServiceError> {
    state
        .api
        .unenroll(request.user_id, request.card_id)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(UnenrollResult { removed: true })))
}

async fn submit_answer(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitAnswerRequest>,
) -> Result<Json<ServiceEnvelope<AnswerOutcome>>, ServiceError> {
    let outcome = state.api.submit_answer(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn create_folder(
    State(state): State<ServiceState>,
    Json(request): Json<CreateFolderRequest>,
) -> Result<Json<ServiceEnvelope<srs_kernel_core::Folder>>, ServiceError> {
    let folder = state.api.create_folder(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(folder)))
}

async fn add_cards(
    State(state): State<ServiceState>,
    Path(folder_id): Path<FolderId>,
    Json(body): Json<AddCardsBody>,
) -> Result<Json<ServiceEnvelope<AddCardsResult>>, ServiceError> {
    let result = state
        .api
        .add_cards_to_folder(AddCardsRequest {
            user_id: body.user_id,
            folder_id,
            card_ids: body.card_ids,
        })
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn folder_queue(
    State(state): State<ServiceState>,
    Path(folder_id): Path<FolderId>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ServiceEnvelope<Vec<srs_kernel_api::QueueItem>>>, ServiceError> {
    let queue =
        state.api.get_queue(query.user_id, folder_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(queue)))
}

async fn srs_status(
    State(state): State<ServiceState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ServiceEnvelope<SrsStatusView>>, ServiceError> {
    let status = state.api.srs_status(query.user_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn streak(
    State(state): State<ServiceState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<ServiceEnvelope<srs_kernel_core::StreakInfo>>, ServiceError> {
    let info = state.api.get_streak_info(query.user_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(info)))
}

async fn wrong_answers(
    State(state): State<ServiceState>,
    Query(query): Query<WrongAnswerQuery>,
) -> Result<Json<ServiceEnvelope<Vec<srs_kernel_api::WrongAnswerView>>>, ServiceError> {
    let entries = state
        .api
        .get_wrong_answers(query.user_id, query.include_completed)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(entries)))
}

async fn complete_wrong_answer(
    State(state): State<ServiceState>,
    Json(request): Json<CompleteWrongAnswerRequest>,
) -> Result<Json<ServiceEnvelope<CompletionResult>>, ServiceError> {
    let result = state.api.complete_wrong_answer(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn time_status(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<TimeStatus>> {
    Json(envelope(state.api.time_status()))
}

async fn set_acceleration(
    State(state): State<ServiceState>,
    Json(request): Json<SetFactorRequest>,
) -> Result<Json<ServiceEnvelope<RecalcReport>>, ServiceError> {
    let report = state
        .api
        .set_acceleration_factor(request.factor)
        .map_err(|err| service_error(&err))?;
    state.supervisor.refresh().await;
    Ok(Json(envelope(report)))
}

async fn set_offset(
    State(state): State<ServiceState>,
    Json(request): Json<SetOffsetRequest>,
) -> Result<Json<ServiceEnvelope<RecalcReport>>, ServiceError> {
    let report = state.api.set_day_offset(request.days).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn reset_time(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RecalcReport>>, ServiceError> {
    let report = state.api.reset_time().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn run_sweep(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<srs_kernel_store_sqlite::SweepCounts>>, ServiceError> {
    let counts = state.api.sweep_overdue().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(counts)))
}

async fn run_notify(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<NotifyReport>>, ServiceError> {
    let report = state.api.six_hourly_notify().map_err(|err| service_error(&err))?;
    for alarm in &report.refreshed {
        state.queue.enqueue(alarm.folder_id, alarm.next_alarm_at);
    }
    Ok(Json(envelope(report)))
}

async fn run_rollup(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RollupReport>>, ServiceError> {
    let report = state.api.midnight_rollup().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use http::Request;
    use srs_kernel_core::{ItemKind, ItemRef};
    use time::macros::datetime;
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("srskernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_state() -> (ServiceState, PathBuf) {
        let path = unique_temp_db_path();
        let clock = Arc::new(Clock::fixed(datetime!(2025-06-01 12:00:00 UTC)));
        let api = SrsKernelApi::new(path.clone(), clock);
        let state = ServiceState {
            supervisor: Arc::new(SweepSupervisor::new(api.clone())),
            queue: Arc::new(AlarmQueue::new()),
            api,
        };
        (state, path)
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn post_json(router: Router, uri: &str, body: serde_json::Value) -> Response {
        let request = match Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
        {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    // Route-level smoke: the envelope carries both contract versions.
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (state, path) = fixture_state();
        let router = app(state);

        let request = match Request::builder().uri("/v1/health").body(Body::empty()) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        let response = match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn enroll_answer_and_conflict_flow() {
        let (state, path) = fixture_state();
        let router = app(state);
        let user_id = UserId::new();

        let response = post_json(
            router.clone(),
            "/v1/srs/cards",
            serde_json::json!({
                "user_id": user_id,
                "items": [ItemRef { kind: ItemKind::Vocab, item_id: 11 }]
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let card_id = response_json(response)
            .await
            .pointer("/data/0/id")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| panic!("missing card id"), ToString::to_string);

        let response = post_json(
            router.clone(),
            "/v1/srs/folders",
            serde_json::json!({
                "user_id": user_id,
                "name": "today",
                "date": null,
                "parent_id": null,
                "kind": null,
                "alarm_on": true,
                "learning_curve": "forgetting_curve"
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let folder_id = response_json(response)
            .await
            .pointer("/data/id")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| panic!("missing folder id"), ToString::to_string);

        let add_uri = format!("/v1/srs/folders/{folder_id}/items");
        let add_body = serde_json::json!({ "user_id": user_id, "card_ids": [card_id] });
        let response = post_json(router.clone(), &add_uri, add_body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Second add of the same card: 409.
        let response = post_json(router.clone(), &add_uri, add_body).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = post_json(
            router.clone(),
            "/v1/srs/answer",
            serde_json::json!({
                "user_id": user_id,
                "folder_id": folder_id,
                "card_id": card_id,
                "correct": true
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/status").and_then(serde_json::Value::as_str), Some("pass"));
        assert_eq!(value.pointer("/data/stage").and_then(serde_json::Value::as_u64), Some(1));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unknown_card_maps_to_not_found() {
        let (state, path) = fixture_state();
        let router = app(state);

        let response = post_json(
            router,
            "/v1/srs/answer",
            serde_json::json!({
                "user_id": UserId::new(),
                "folder_id": null,
                "card_id": CardId::new(),
                "correct": true
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_factor_maps_to_bad_request() {
        let (state, path) = fixture_state();
        let router = app(state);

        let response =
            post_json(router.clone(), "/v1/time/acceleration", serde_json::json!({"factor": 0}))
                .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            post_json(router, "/v1/time/acceleration", serde_json::json!({"factor": 60})).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.pointer("/data/current/acceleration_factor").and_then(serde_json::Value::as_u64),
            Some(60)
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn factor_change_retunes_the_sweep_supervisor() {
        let (state, path) = fixture_state();
        state.supervisor.refresh().await;
        assert_eq!(
            state.supervisor.current_cadence().await,
            Some(std::time::Duration::from_secs(600))
        );

        let router = app(state.clone());
        let response =
            post_json(router, "/v1/time/acceleration", serde_json::json!({"factor": 1440})).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.supervisor.current_cadence().await,
            Some(std::time::Duration::from_secs(5))
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn alarm_queue_replaces_duplicate_folder_keys() {
        let queue = AlarmQueue::new();
        let folder_id = FolderId::new();
        let early = datetime!(2025-06-01 06:00:00 UTC);
        let late = datetime!(2025-06-01 12:00:00 UTC);

        queue.enqueue(folder_id, early);
        queue.enqueue(folder_id, late);
        assert_eq!(queue.pending_count(), 1, "no stacked duplicate fires");

        assert!(queue.drain_due(early).is_empty(), "replaced target is the later one");
        let due = queue.drain_due(late);
        assert_eq!(due, vec![(folder_id, late)]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn rollup_fires_shortly_after_midnight() {
        let now = datetime!(2025-06-01 23:50:00 UTC);
        assert_eq!(next_rollup_at(now), datetime!(2025-06-02 00:05:00 UTC));
    }
}
