pub mod helix;
pub mod oauth;

pub use helix::{
    CreateSubscriptionRequest, EventSubSubscription, HelixClient, HelixError, HelixUser,
};
pub use oauth::{AuthorizeUrlParams, OAuthError, TokenResponse, TwitchOAuthClient};
