use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use redeem_ledger_core::RedemptionSummary;
use serde::Deserialize;
use tracing::error;

use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct TaxResultsQuery {
    #[serde(default)]
    pub reward_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// Lists redemptions of one reward between two RFC3339 instants, inclusive.
pub async fn tax_results(
    State(state): State<AppState>,
    Query(query): Query<TaxResultsQuery>,
) -> Result<Json<Vec<RedemptionSummary>>, ProblemResponse> {
    let reward_id = query
        .reward_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| bad_request("reward_id is required"))?;
    let start = parse_instant("start_date", query.start_date.as_deref())?;
    let end = parse_instant("end_date", query.end_date.as_deref())?;
    if start > end {
        return Err(bad_request("start_date must not be after end_date"));
    }

    let rows = state
        .storage()
        .redemptions()
        .list_by_reward(reward_id, start, end)
        .await
        .map_err(|err| {
            error!(stage = "storage", %reward_id, error = %err, "failed to list redemptions");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "failed to load redemptions",
            )
            .with_error(err)
        })?;

    Ok(Json(rows.into_iter().map(RedemptionSummary::from).collect()))
}

fn parse_instant(name: &str, raw: Option<&str>) -> Result<DateTime<Utc>, ProblemResponse> {
    let raw = raw
        .filter(|value| !value.is_empty())
        .ok_or_else(|| bad_request(format!("{name} is required")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| bad_request(format!("{name} must be an RFC3339 timestamp")).with_error(err))
}

fn bad_request(message: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_request", message)
}
