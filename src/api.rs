use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::aggregate::{get_income_summary, get_payments_for_subtree};
use crate::commission::{RuleSet, RuleSetInput, list_rule_sets, put_rule_set};
use crate::config::Config;
use crate::distribution::{RetryReport, distribute_commission, retry_pending_distributions};
use crate::error::{ApiErrorWithMeta, IncomeError};
use crate::hierarchy::register_user;
use crate::payments::{
    ConfirmationOutcome, PaymentConfirmation, create_payment, handle_payment_confirmation,
};
use crate::responses::{ApiOk, Pagination, RequestMeta, meta_middleware};
use crate::store::Store;
use crate::types::{
    IncomeRecord, IncomeSummary, NewPayment, NewUser, Payment, Period, SubtreePayment, UserId,
    UserNode,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The persistence backend.
    pub store: Arc<dyn Store>,
    /// The application configuration.
    pub config: Config,
}

/// A user together with its depth in the referral tree.
#[derive(Serialize)]
pub struct UserResponse {
    #[serde(flatten)]
    pub user: UserNode,
    /// Distance to the root of the user's tree.
    pub depth: usize,
}

/// The income written for one payment.
#[derive(Serialize)]
pub struct DistributionResponse {
    /// The ID of the distributed payment.
    pub payment_id: Uuid,
    /// The income records of the payment.
    pub records: Vec<IncomeRecord>,
}

/// Query parameters for the subtree payment table.
#[derive(Deserialize)]
pub struct SubtreePaymentsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", post(register_user_handler))
        .route("/users/{id}", get(get_user_handler))
        .route("/users/{id}/income-summary", get(income_summary_handler))
        .route("/users/{id}/payments", get(subtree_payments_handler))
        .route("/payments", post(create_payment_handler))
        .route("/payments/{id}/distribute", post(distribute_handler))
        .route("/payments/{id}/income", get(payment_income_handler))
        .route("/webhooks/payment", post(payment_webhook_handler))
        .route("/distributions/retry", post(retry_distributions_handler))
        .route(
            "/commission-rules",
            get(list_rule_sets_handler).put(put_rule_set_handler),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn register_user_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewUser>,
) -> Result<ApiOk<UserNode>, ApiErrorWithMeta> {
    let user = register_user(st.store.as_ref(), req)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("user registered", user, meta))
}

async fn get_user_handler(
    State(st): State<AppState>,
    Path(id): Path<UserId>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<UserResponse>, ApiErrorWithMeta> {
    let user = st
        .store
        .get_user(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?
        .ok_or_else(|| IncomeError::UserNotFound(id).into_api(meta.clone()))?;
    let depth = st
        .store
        .depth(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?
        .ok_or_else(|| IncomeError::UserNotFound(id).into_api(meta.clone()))?;
    Ok(ApiOk::ok("user fetched", UserResponse { user, depth }, meta))
}

async fn income_summary_handler(
    State(st): State<AppState>,
    Path(id): Path<UserId>,
    Query(period): Query<Period>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<IncomeSummary>, ApiErrorWithMeta> {
    let summary = get_income_summary(st.store.as_ref(), id, period)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("income summary fetched", summary, meta))
}

async fn subtree_payments_handler(
    State(st): State<AppState>,
    Path(id): Path<UserId>,
    Query(q): Query<SubtreePaymentsQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<SubtreePayment>>, ApiErrorWithMeta> {
    let rows = get_payments_for_subtree(st.store.as_ref(), id, Period::new(q.start, q.end))
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    let pagination = Pagination::new(q.page, q.per_page, rows.len() as u64);
    let page = pagination.slice(rows);
    Ok(ApiOk::ok("payments fetched", page, meta).with_pagination(pagination))
}

async fn create_payment_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewPayment>,
) -> Result<ApiOk<Payment>, ApiErrorWithMeta> {
    let payment = create_payment(st.store.as_ref(), req)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("payment created", payment, meta))
}

async fn distribute_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<DistributionResponse>, ApiErrorWithMeta> {
    let records = distribute_commission(st.store.as_ref(), id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok(
        "commission distributed",
        DistributionResponse {
            payment_id: id,
            records,
        },
        meta,
    ))
}

async fn payment_income_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<DistributionResponse>, ApiErrorWithMeta> {
    let store = st.store.as_ref();
    let payment = store
        .get_payment(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    if payment.is_none() {
        return Err(IncomeError::PaymentNotFound(id.to_string()).into_api(meta));
    }
    let records = store
        .income_for_payment(id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok(
        "payment income fetched",
        DistributionResponse {
            payment_id: id,
            records,
        },
        meta,
    ))
}

async fn payment_webhook_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<PaymentConfirmation>,
) -> Result<ApiOk<ConfirmationOutcome>, ApiErrorWithMeta> {
    let outcome = handle_payment_confirmation(
        st.store.as_ref(),
        &st.config.payment_webhook_secret,
        req,
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("payment confirmation processed", outcome, meta))
}

async fn retry_distributions_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<RetryReport>, ApiErrorWithMeta> {
    let report = retry_pending_distributions(st.store.as_ref())
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("pending distributions retried", report, meta))
}

async fn put_rule_set_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RuleSetInput>,
) -> Result<ApiOk<RuleSet>, ApiErrorWithMeta> {
    let set = put_rule_set(st.store.as_ref(), req)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("commission rules saved", set, meta))
}

async fn list_rule_sets_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<RuleSet>>, ApiErrorWithMeta> {
    let sets = list_rule_sets(st.store.as_ref())
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("commission rules fetched", sets, meta))
}
