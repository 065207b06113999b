//! EventSub webhook ingestion.
//!
//! Every delivery walks the same path: resolve the subscriber, check
//! freshness, authenticate, reserve the message id, decode, then persist.
//! Once the reservation is taken, any non-2xx outcome releases it so Twitch's
//! retry can be processed again.

use std::{sync::Arc, time::Duration, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use redeem_ledger_core::{dedup_key, CallbackMessage, REDEMPTION_EVENT_TYPE};
use redeem_ledger_storage::{Database, RedemptionInsertOutcome, Reservation};
use tracing::{debug, error, info, warn};

use crate::router::{AppState, Clock};
use crate::signature::verify_signature;

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_SIGNATURE: &str = "twitch-eventsub-message-signature";

const MAX_MESSAGE_AGE_SECS: i64 = 600;

/// A raw webhook request as received on `/webhook/{user_id}`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub user_id: String,
    pub message_id: String,
    pub timestamp: String,
    pub signature: String,
    pub body: Bytes,
}

impl Delivery {
    /// Builds a delivery from request parts; missing headers become empty strings.
    pub fn from_request(user_id: String, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            user_id,
            message_id: header_value(headers, HEADER_MESSAGE_ID),
            timestamp: header_value(headers, HEADER_TIMESTAMP),
            signature: header_value(headers, HEADER_SIGNATURE),
            body,
        }
    }
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted(Acceptance),
    Deduped,
    Rejected(Rejection),
    Errored(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Stored,
    AlreadyStored,
    Revoked,
    Challenge(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownSubscriber,
    InvalidTimestamp,
    StaleTimestamp,
    MissingMessageId,
    InvalidSignature,
    MalformedPayload,
}

impl DeliveryOutcome {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Accepted(_) | Self::Deduped => StatusCode::OK,
            Self::Rejected(Rejection::UnknownSubscriber) => StatusCode::NOT_FOUND,
            Self::Rejected(Rejection::InvalidSignature) => StatusCode::FORBIDDEN,
            Self::Rejected(_) => StatusCode::BAD_REQUEST,
            Self::Errored(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Accepted(Acceptance::Stored) => "stored",
            Self::Accepted(Acceptance::AlreadyStored) => "already_stored",
            Self::Accepted(Acceptance::Revoked) => "revoked",
            Self::Accepted(Acceptance::Challenge(_)) => "challenge",
            Self::Deduped => "deduped",
            Self::Rejected(Rejection::UnknownSubscriber) => "unknown_subscriber",
            Self::Rejected(Rejection::InvalidTimestamp) => "invalid_timestamp",
            Self::Rejected(Rejection::StaleTimestamp) => "stale_timestamp",
            Self::Rejected(Rejection::MissingMessageId) => "missing_message_id",
            Self::Rejected(Rejection::InvalidSignature) => "invalid_signature",
            Self::Rejected(Rejection::MalformedPayload) => "malformed_payload",
            Self::Errored(_) => "errored",
        }
    }
}

impl IntoResponse for DeliveryOutcome {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Accepted(Acceptance::Challenge(challenge)) => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                challenge,
            )
                .into_response(),
            _ => (status, Body::empty()).into_response(),
        }
    }
}

/// Authenticates and records EventSub deliveries.
pub struct IngestionPipeline {
    database: Database,
    secret: Arc<[u8]>,
    dedup_ttl: Duration,
    clock: Clock,
}

impl IngestionPipeline {
    pub fn new(database: Database, secret: Arc<[u8]>, dedup_ttl: Duration, clock: Clock) -> Self {
        Self {
            database,
            secret,
            dedup_ttl,
            clock,
        }
    }

    pub async fn ingest(&self, delivery: Delivery) -> DeliveryOutcome {
        let user_id = delivery.user_id.as_str();
        let message_id = delivery.message_id.as_str();

        match self.database.subscriptions().fetch_by_user(user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(stage = "ingress", %user_id, %message_id, "delivery for unknown subscriber");
                return DeliveryOutcome::Rejected(Rejection::UnknownSubscriber);
            }
            Err(err) => {
                error!(stage = "ingress", %user_id, %message_id, error = %err, "failed to load subscription");
                return DeliveryOutcome::Errored("subscription lookup failed");
            }
        }

        let now = (self.clock)();
        if let Err(rejection) = check_freshness(&delivery.timestamp, now) {
            warn!(
                stage = "ingress",
                %user_id,
                %message_id,
                timestamp = %delivery.timestamp,
                now = %now.to_rfc3339(),
                "timestamp outside the 10 minute window"
            );
            return DeliveryOutcome::Rejected(rejection);
        }

        if message_id.is_empty() {
            warn!(stage = "ingress", %user_id, "delivery without message id");
            return DeliveryOutcome::Rejected(Rejection::MissingMessageId);
        }

        if let Err(err) = verify_signature(
            &self.secret,
            message_id,
            &delivery.timestamp,
            &delivery.body,
            &delivery.signature,
        ) {
            counter!("eventsub_invalid_signature_total").increment(1);
            warn!(stage = "ingress", %user_id, %message_id, error = %err, "signature verification failed");
            return DeliveryOutcome::Rejected(Rejection::InvalidSignature);
        }

        let key = dedup_key(REDEMPTION_EVENT_TYPE, user_id, message_id);
        match self
            .database
            .ephemeral()
            .set_if_absent(&key, "1", now, self.dedup_ttl)
            .await
        {
            Ok(Reservation::Acquired) => {}
            Ok(Reservation::Held) => {
                info!(stage = "ingress", %user_id, %message_id, "duplicate delivery skipped");
                return DeliveryOutcome::Deduped;
            }
            Err(err) => {
                error!(stage = "ingress", %user_id, %message_id, error = %err, "failed to reserve message id");
                return DeliveryOutcome::Errored("dedup reservation failed");
            }
        }

        let outcome = self.process_reserved(&delivery, now).await;
        if !outcome.status().is_success() {
            self.release(&key, user_id, message_id).await;
        }
        outcome
    }

    async fn process_reserved(&self, delivery: &Delivery, now: DateTime<Utc>) -> DeliveryOutcome {
        let user_id = delivery.user_id.as_str();
        let message_id = delivery.message_id.as_str();

        let message = match CallbackMessage::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(stage = "ingress", %user_id, %message_id, error = %err, "failed to decode payload");
                return DeliveryOutcome::Rejected(Rejection::MalformedPayload);
            }
        };

        debug!(stage = "ingress", %user_id, %message_id, kind = message.kind(), "payload decoded");
        match message {
            CallbackMessage::Revocation { subscription } => {
                warn!(
                    stage = "ingress",
                    %user_id,
                    %message_id,
                    subscription_id = %subscription.id,
                    status = ?subscription.status,
                    "subscription revoked upstream"
                );
                DeliveryOutcome::Accepted(Acceptance::Revoked)
            }
            CallbackMessage::Challenge {
                challenge,
                subscription,
            } => {
                info!(
                    stage = "ingress",
                    %user_id,
                    %message_id,
                    subscription_id = %subscription.id,
                    "answering verification challenge"
                );
                DeliveryOutcome::Accepted(Acceptance::Challenge(challenge))
            }
            CallbackMessage::Redemption { event, .. } => {
                let redemption = event.into_redemption();
                match self.database.redemptions().insert(&redemption, now).await {
                    Ok(RedemptionInsertOutcome::Inserted) => {
                        info!(
                            stage = "ingress",
                            %user_id,
                            %message_id,
                            event_id = %redemption.event_id,
                            reward_id = %redemption.reward_id,
                            cost = redemption.cost,
                            "redemption recorded"
                        );
                        DeliveryOutcome::Accepted(Acceptance::Stored)
                    }
                    Ok(RedemptionInsertOutcome::Duplicate) => {
                        info!(
                            stage = "ingress",
                            %user_id,
                            %message_id,
                            event_id = %redemption.event_id,
                            "redemption already recorded"
                        );
                        DeliveryOutcome::Accepted(Acceptance::AlreadyStored)
                    }
                    Err(err) => {
                        error!(
                            stage = "ingress",
                            %user_id,
                            %message_id,
                            event_id = %redemption.event_id,
                            error = %err,
                            "failed to persist redemption"
                        );
                        DeliveryOutcome::Errored("redemption insert failed")
                    }
                }
            }
        }
    }

    async fn release(&self, key: &str, user_id: &str, message_id: &str) {
        if let Err(err) = self.database.ephemeral().delete(key).await {
            error!(
                stage = "ingress",
                %user_id,
                %message_id,
                error = %err,
                "failed to release dedup reservation"
            );
        }
    }
}

fn check_freshness(raw: &str, now: DateTime<Utc>) -> Result<(), Rejection> {
    let timestamp = DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| Rejection::InvalidTimestamp)?;

    let max_age = ChronoDuration::seconds(MAX_MESSAGE_AGE_SECS);
    let skew = now.signed_duration_since(timestamp);
    if skew > max_age || skew < -max_age {
        return Err(Rejection::StaleTimestamp);
    }
    Ok(())
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

pub async fn handle(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let delivery = Delivery::from_request(user_id, &headers, body);
    let pipeline = state.ingestion();

    // Runs detached so a client disconnect cannot drop the future after the
    // reservation is taken.
    let outcome = match tokio::spawn(async move { pipeline.ingest(delivery).await }).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(stage = "ingress", error = %err, "ingestion task failed");
            DeliveryOutcome::Errored("ingestion task failed")
        }
    };

    if let DeliveryOutcome::Errored(reason) = &outcome {
        error!(stage = "ingress", reason = *reason, "delivery not acknowledged");
    }

    let label = outcome.metric_label();
    counter!("webhook_deliveries_total", "outcome" => label).increment(1);
    histogram!("webhook_ack_latency_seconds", "outcome" => label)
        .record(start.elapsed().as_secs_f64());

    outcome.into_response()
}
