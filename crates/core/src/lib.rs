pub mod callback;
pub mod types;

pub use callback::{
    CallbackError, CallbackMessage, RedemptionEvent, RewardInfo, SubscriptionCondition,
    SubscriptionInfo, SubscriptionStatus,
};
pub use types::{
    csrf_key, dedup_key, Redemption, RedemptionSummary, Subscription, REDEMPTION_EVENT_TYPE,
    REDEMPTION_EVENT_VERSION,
};
