//! Decoding of EventSub webhook bodies.
//!
//! A delivery is one of three shapes: a verification challenge, a revocation
//! notice, or a redemption notification. The raw JSON is decoded into
//! [`CallbackMessage`] by checking which fields are present instead of probing
//! an untyped map.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::types::Redemption;

/// A decoded webhook body.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackMessage {
    /// Sent once after subscribing; the challenge must be echoed verbatim.
    Challenge {
        challenge: String,
        subscription: SubscriptionInfo,
    },
    /// The subscription has been revoked upstream.
    Revocation { subscription: SubscriptionInfo },
    /// A viewer redeemed a reward.
    Redemption {
        subscription: SubscriptionInfo,
        event: RedemptionEvent,
    },
}

impl CallbackMessage {
    /// Decodes a raw request body.
    ///
    /// Revocation takes precedence over a challenge, which takes precedence over
    /// an event payload.
    pub fn from_slice(body: &[u8]) -> Result<Self, CallbackError> {
        let raw: RawEnvelope = serde_json::from_slice(body)?;

        if raw.subscription.status.is_revoked() {
            return Ok(Self::Revocation {
                subscription: raw.subscription,
            });
        }

        if let Some(challenge) = raw.challenge.filter(|value| !value.is_empty()) {
            return Ok(Self::Challenge {
                challenge,
                subscription: raw.subscription,
            });
        }

        match raw.event {
            Some(event) => Ok(Self::Redemption {
                subscription: raw.subscription,
                event,
            }),
            None => Err(CallbackError::MissingEvent),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "challenge",
            Self::Revocation { .. } => "revocation",
            Self::Redemption { .. } => "redemption",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    subscription: SubscriptionInfo,
    #[serde(default)]
    event: Option<RedemptionEvent>,
}

/// Subscription metadata embedded in every delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub condition: SubscriptionCondition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionCondition {
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
}

/// Status reported for the subscription that produced a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Enabled,
    WebhookCallbackVerificationPending,
    AuthorizationRevoked,
    UserRemoved,
    NotificationFailuresExceeded,
    VersionRemoved,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    /// Returns `true` for statuses Twitch sends with a revocation notice.
    pub fn is_revoked(self) -> bool {
        matches!(
            self,
            Self::AuthorizationRevoked
                | Self::UserRemoved
                | Self::NotificationFailuresExceeded
                | Self::VersionRemoved
        )
    }
}

/// Event payload of a reward redemption notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedemptionEvent {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
    pub reward: RewardInfo,
    pub redeemed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewardInfo {
    pub id: String,
    pub title: String,
    pub cost: u32,
}

impl RedemptionEvent {
    pub fn into_redemption(self) -> Redemption {
        Redemption {
            event_id: self.id,
            reward_id: self.reward.id,
            reward_name: self.reward.title,
            user_id: self.user_id,
            user_name: self.user_name,
            cost: self.reward.cost,
            redeemed_at: self.redeemed_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to decode callback payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("callback payload carries neither a challenge nor an event")]
    MissingEvent,
}
