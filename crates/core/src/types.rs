use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EventSub subscription type handled by this service.
pub const REDEMPTION_EVENT_TYPE: &str = "channel.channel_points_custom_reward_redemption.add";

/// Version of [`REDEMPTION_EVENT_TYPE`] requested when subscribing.
pub const REDEMPTION_EVENT_VERSION: &str = "1";

/// A broadcaster's live webhook registration.
///
/// At most one exists per `user_id`; re-authorization replaces it by deleting
/// the old record before inserting the new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub subscription_id: String,
    pub created_at: DateTime<Utc>,
}

/// A single channel-points redemption, keyed by the upstream event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub event_id: String,
    pub reward_id: String,
    pub reward_name: String,
    pub user_id: String,
    pub user_name: String,
    pub cost: u32,
    pub redeemed_at: DateTime<Utc>,
}

/// Subset of a redemption exposed by the reporting endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionSummary {
    pub user_id: String,
    pub cost: u32,
    pub redeemed_at: DateTime<Utc>,
}

impl From<Redemption> for RedemptionSummary {
    fn from(value: Redemption) -> Self {
        Self {
            user_id: value.user_id,
            cost: value.cost,
            redeemed_at: value.redeemed_at,
        }
    }
}

/// Builds the ephemeral-store key guarding a single webhook delivery.
pub fn dedup_key(event_type: &str, user_id: &str, message_id: &str) -> String {
    format!("dedup:{event_type}:{user_id}:{message_id}")
}

/// Builds the ephemeral-store key marking a CSRF token as consumed.
pub fn csrf_key(token: &str) -> String {
    format!("csrf:{token}")
}
