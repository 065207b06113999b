use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for the Helix endpoints used to identify broadcasters and manage EventSub.
#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    client_id: String,
}

impl HelixClient {
    /// Creates a new Helix client with the provided configuration.
    pub fn new(client_id: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
        }
    }

    /// Returns the users identified by the bearer token (the token owner when no filter is given).
    pub async fn get_users(&self, access_token: &str) -> Result<Vec<HelixUser>, HelixError> {
        let url = self.base_url.join("users")?;
        let response = self
            .authorized_request(Method::GET, url, access_token)
            .send()
            .await?;

        parse_json::<DataResponse<HelixUser>>(response)
            .await
            .map(|page| page.data)
    }

    /// Registers a webhook subscription and returns the records Twitch created.
    pub async fn create_eventsub_subscription(
        &self,
        app_token: &str,
        request: &CreateSubscriptionRequest<'_>,
    ) -> Result<Vec<EventSubSubscription>, HelixError> {
        let url = self.base_url.join("eventsub/subscriptions")?;
        let body = CreateSubscriptionBody {
            kind: request.event_type,
            version: request.version,
            condition: Condition {
                broadcaster_user_id: request.broadcaster_user_id,
            },
            transport: Transport {
                method: "webhook",
                callback: request.callback,
                secret: request.secret,
            },
        };

        let response = self
            .authorized_request(Method::POST, url, app_token)
            .json(&body)
            .send()
            .await?;

        parse_json::<DataResponse<EventSubSubscription>>(response)
            .await
            .map(|page| page.data)
    }

    /// Deletes a webhook subscription by id.
    pub async fn delete_eventsub_subscription(
        &self,
        app_token: &str,
        subscription_id: &str,
    ) -> Result<(), HelixError> {
        let mut url = self.base_url.join("eventsub/subscriptions")?;
        url.query_pairs_mut().append_pair("id", subscription_id);

        let response = self
            .authorized_request(Method::DELETE, url, app_token)
            .send()
            .await?;

        ensure_success(response).await
    }

    fn authorized_request(
        &self,
        method: Method,
        url: Url,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .header("Authorization", format!("Bearer {access_token}"))
    }
}

/// Parameters for creating a webhook subscription.
pub struct CreateSubscriptionRequest<'a> {
    pub event_type: &'a str,
    pub version: &'a str,
    pub broadcaster_user_id: &'a str,
    pub callback: &'a str,
    pub secret: &'a str,
}

#[derive(Serialize)]
struct CreateSubscriptionBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: &'a str,
    condition: Condition<'a>,
    transport: Transport<'a>,
}

#[derive(Serialize)]
struct Condition<'a> {
    broadcaster_user_id: &'a str,
}

#[derive(Serialize)]
struct Transport<'a> {
    method: &'a str,
    callback: &'a str,
    secret: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct DataResponse<T> {
    data: Vec<T>,
}

/// Representation of a Helix user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    pub display_name: String,
}

/// Subscription record returned when creating a subscription.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EventSubSubscription {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

/// Errors produced by the Helix client.
#[derive(Debug, Error)]
pub enum HelixError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl HelixError {
    /// Returns `true` when Twitch rejected the bearer token itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

async fn ensure_success(response: Response) -> Result<(), HelixError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }
    Ok(())
}

async fn parse_json<T>(response: Response) -> Result<T, HelixError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(HelixError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method;
    use serde_json::json;

    fn client(base_url: &Url) -> HelixClient {
        HelixClient::new(
            "client-id",
            base_url.clone(),
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn get_users_parses_response() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/helix/users")
                    .header("Authorization", "Bearer user-token")
                    .header("Client-Id", "client-id");
                then.status(200).json_body(json!({
                    "data": [
                        {
                            "id": "b-1",
                            "login": "streamer",
                            "display_name": "Streamer",
                            "type": "",
                            "broadcaster_type": "affiliate"
                        }
                    ]
                }));
            })
            .await;

        let users = client.get_users("user-token").await.expect("get users");
        mock.assert_async().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "b-1");
        assert_eq!(users[0].display_name, "Streamer");
    }

    #[tokio::test]
    async fn create_subscription_sends_webhook_transport() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/helix/eventsub/subscriptions")
                    .header("Authorization", "Bearer app-token")
                    .json_body(json!({
                        "type": "channel.channel_points_custom_reward_redemption.add",
                        "version": "1",
                        "condition": {"broadcaster_user_id": "b-1"},
                        "transport": {
                            "method": "webhook",
                            "callback": "https://ledger.example/webhook/b-1",
                            "secret": "0123456789"
                        }
                    }));
                then.status(202).json_body(json!({
                    "data": [
                        {
                            "id": "sub-1",
                            "status": "webhook_callback_verification_pending",
                            "type": "channel.channel_points_custom_reward_redemption.add",
                            "version": "1",
                            "condition": {"broadcaster_user_id": "b-1"},
                            "created_at": "2024-01-01T00:00:00Z",
                            "transport": {
                                "method": "webhook",
                                "callback": "https://ledger.example/webhook/b-1"
                            },
                            "cost": 1
                        }
                    ],
                    "total": 1,
                    "total_cost": 1,
                    "max_total_cost": 10000
                }));
            })
            .await;

        let created = client
            .create_eventsub_subscription(
                "app-token",
                &CreateSubscriptionRequest {
                    event_type: "channel.channel_points_custom_reward_redemption.add",
                    version: "1",
                    broadcaster_user_id: "b-1",
                    callback: "https://ledger.example/webhook/b-1",
                    secret: "0123456789",
                },
            )
            .await
            .expect("create subscription");
        mock.assert_async().await;

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].id, "sub-1");
        assert_eq!(created[0].status, "webhook_callback_verification_pending");
    }

    #[tokio::test]
    async fn delete_subscription_passes_id() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        let mock = server
            .mock_async(|when, then| {
                when.method(Method::DELETE)
                    .path("/helix/eventsub/subscriptions")
                    .query_param("id", "sub-1")
                    .header("Client-Id", "client-id");
                then.status(204);
            })
            .await;

        client
            .delete_eventsub_subscription("app-token", "sub-1")
            .await
            .expect("delete subscription");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_returns_message() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(Method::DELETE).path("/helix/eventsub/subscriptions");
                then.status(404).body("not found");
            })
            .await;

        let err = client
            .delete_eventsub_subscription("app-token", "missing")
            .await
            .expect_err("should error");
        assert!(!err.is_unauthorized());
        match err {
            HelixError::Status { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejected_token_is_reported_as_unauthorized() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/helix/")).expect("url");
        let client = client(&base);

        server
            .mock_async(|when, then| {
                when.method(POST).path("/helix/eventsub/subscriptions");
                then.status(401).body("invalid oauth token");
            })
            .await;

        let err = client
            .create_eventsub_subscription(
                "expired-token",
                &CreateSubscriptionRequest {
                    event_type: "channel.channel_points_custom_reward_redemption.add",
                    version: "1",
                    broadcaster_user_id: "b-1",
                    callback: "https://ledger.example/webhook/b-1",
                    secret: "0123456789abcdef",
                },
            )
            .await
            .expect_err("should error");
        assert!(err.is_unauthorized());
    }
}
