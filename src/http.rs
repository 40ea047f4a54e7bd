//! Rate-limit aware HTTP client for the Discord REST API.
//!
//! Every outbound Discord call goes through [`DiscordHttpClient::request`] so
//! auth headers, per-bucket back-off, and error mapping live in one place.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::CommandScope;
use crate::handlers::{ChatApi, HandlerError};
use crate::types::*;

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = "DiscordBot (https://github.com/gpu-usage-bot, 0.1)";
const MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct BucketState {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route key → bucket id.
    route_buckets: HashMap<String, String>,
    /// Bucket id → state.
    buckets: HashMap<String, BucketState>,
    /// No request may be sent before this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route_key`, if at all.
    fn delay_for(&self, route_key: &str, now: Instant) -> Option<Duration> {
        if let Some(until) = self.global_until.filter(|&until| until > now) {
            return Some(until - now);
        }

        let bucket_id = self.route_buckets.get(route_key)?;
        let state = self.buckets.get(bucket_id)?;
        (state.remaining == 0 && state.resets_at > now).then(|| state.resets_at - now)
    }

    fn update(&mut self, route_key: &str, info: &RateLimitInfo, now: Instant) {
        let reset_after = info
            .reset_after
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(1));

        if info.is_global {
            self.global_until = Some(now + reset_after);
        }

        if let Some(ref bucket) = info.bucket {
            self.route_buckets
                .insert(route_key.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                BucketState {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: now + reset_after,
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum HttpError {
    /// Non-success status from Discord.
    Api {
        status: u16,
        body: String,
        route: String,
    },
    /// Transport / network error.
    Transport(String),
    /// Serialisation error.
    Serde(String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Api {
                status,
                body,
                route,
            } => write!(f, "Discord API error {} on {}: {}", status, route, body),
            HttpError::Transport(e) => write!(f, "HTTP transport error: {}", e),
            HttpError::Serde(e) => write!(f, "Serialisation error: {}", e),
        }
    }
}

impl std::error::Error for HttpError {}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// A thin, rate-limit aware client for the Discord REST API.
///
/// Cheap to clone (internals are behind `Arc`).
#[derive(Clone)]
pub struct DiscordHttpClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(token: impl Into<String>) -> Result<Self, HttpError> {
        Self::with_base_url(token, BASE_URL)
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        })
    }

    /// Send a request to `{base_url}/{path}` and return the raw body.
    ///
    /// `route_key` buckets the request for rate limiting, e.g.
    /// `PATCH /channels/{channel_id}/messages`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RETRIES {
            let delay = self.limiter.lock().await.delay_for(route_key, Instant::now());
            if let Some(delay) = delay {
                let delay = delay.min(Duration::from_secs(60));
                debug!(
                    route = route_key,
                    delay_ms = delay.as_millis() as u64,
                    "rate-limit pre-emptive backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("authorization", format!("Bot {}", self.token));
            if let Some(json) = body {
                req = req.json(json);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            let status = resp.status();
            let rl_info = parse_rate_limit_headers(resp.headers());
            self.limiter
                .lock()
                .await
                .update(route_key, &rl_info, Instant::now());

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RETRIES {
                let retry_after = rl_info.reset_after.unwrap_or(1.0).min(60.0);
                warn!(
                    route = route_key,
                    attempt,
                    retry_after_s = retry_after,
                    global = rl_info.is_global,
                    "rate-limited by Discord, backing off"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                continue;
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;

            if status.is_success() {
                return Ok(bytes.to_vec());
            }

            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
                route: route_key.to_string(),
            });
        }

        Err(HttpError::Api {
            status: 429,
            body: "rate-limited after max retries".to_string(),
            route: route_key.to_string(),
        })
    }

    /// Like [`Self::request`] but deserialises the response body as JSON.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route_key: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route_key, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let raw = String::from_utf8_lossy(&bytes);
            HttpError::Serde(format!("{}: {}", e, raw.chars().take(200).collect::<String>()))
        })
    }

    // ------------------------------------------------------------------
    // Interactions
    // ------------------------------------------------------------------

    /// Send the initial response to an interaction.
    pub async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError> {
        let path = format!(
            "interactions/{}/{}/callback",
            interaction_id, interaction_token
        );
        let body = to_json(response)?;
        // 204 No Content on success.
        self.request(Method::POST, &path, "POST /interactions/callback", Some(&body))
            .await?;
        Ok(())
    }

    /// Edit the original (possibly deferred) interaction response.
    pub async fn edit_original_interaction_response(
        &self,
        application_id: &str,
        interaction_token: &str,
        edit: &EditMessage,
    ) -> Result<Message, HttpError> {
        let path = format!(
            "webhooks/{}/{}/messages/@original",
            application_id, interaction_token
        );
        let body = to_json(edit)?;
        self.request_json(
            Method::PATCH,
            &path,
            "PATCH /webhooks/interaction/messages/@original",
            Some(&body),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Channels / messages
    // ------------------------------------------------------------------

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<Message, HttpError> {
        let path = format!("channels/{}/messages/{}", channel_id, message_id);
        let route_key = format!("PATCH /channels/{}/messages", channel_id);
        let body = to_json(edit)?;
        self.request_json(Method::PATCH, &path, &route_key, Some(&body))
            .await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Channel, HttpError> {
        let path = format!("channels/{}", channel_id);
        let route_key = format!("GET /channels/{}", channel_id);
        self.request_json(Method::GET, &path, &route_key, None)
            .await
    }

    // ------------------------------------------------------------------
    // Slash command registration
    // ------------------------------------------------------------------

    /// Register (or overwrite) global application commands.
    pub async fn bulk_overwrite_global_commands(
        &self,
        application_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        let path = format!("applications/{}/commands", application_id);
        let route_key = format!("PUT /applications/{}/commands", application_id);
        let body = to_json(commands)?;
        self.request_json(Method::PUT, &path, &route_key, Some(&body))
            .await
    }

    /// Register (or overwrite) guild-scoped application commands.
    pub async fn bulk_overwrite_guild_commands(
        &self,
        application_id: &str,
        guild_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        let path = format!(
            "applications/{}/guilds/{}/commands",
            application_id, guild_id
        );
        let route_key = format!(
            "PUT /applications/{}/guilds/{}/commands",
            application_id, guild_id
        );
        let body = to_json(commands)?;
        self.request_json(Method::PUT, &path, &route_key, Some(&body))
            .await
    }
}

impl fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, HttpError> {
    serde_json::to_value(value).map_err(|e| HttpError::Serde(e.to_string()))
}

// ---------------------------------------------------------------------------
// ChatApi seam
// ---------------------------------------------------------------------------

impl ChatApi for DiscordHttpClient {
    async fn respond(
        &self,
        interaction: &Interaction,
        response: &InteractionResponse,
    ) -> Result<(), HandlerError> {
        Ok(self
            .create_interaction_response(&interaction.id, &interaction.token, response)
            .await?)
    }

    async fn edit_original_response(
        &self,
        interaction: &Interaction,
        edit: &EditMessage,
    ) -> Result<Message, HandlerError> {
        Ok(self
            .edit_original_interaction_response(
                &interaction.application_id,
                &interaction.token,
                edit,
            )
            .await?)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        edit: &EditMessage,
    ) -> Result<Message, HandlerError> {
        Ok(DiscordHttpClient::edit_message(self, channel_id, message_id, edit).await?)
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<Channel, HandlerError> {
        Ok(self.get_channel(channel_id).await?)
    }

    async fn register_commands(
        &self,
        application_id: &str,
        scope: &CommandScope,
        commands: &[ApplicationCommand],
    ) -> Result<usize, HandlerError> {
        match scope {
            CommandScope::Global => Ok(self
                .bulk_overwrite_global_commands(application_id, commands)
                .await?
                .len()),
            CommandScope::Guilds(guild_ids) => {
                let mut registered = 0;
                for guild_id in guild_ids {
                    let cmds = self
                        .bulk_overwrite_guild_commands(application_id, guild_id, commands)
                        .await?;
                    debug!(guild_id = %guild_id, count = cmds.len(), "registered guild commands");
                    registered += cmds.len();
                }
                Ok(registered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DiscordHttpClient: Send, Sync, Clone);

    #[test]
    fn limiter_waits_on_exhausted_bucket() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();
        let info = RateLimitInfo {
            remaining: Some(0),
            reset_after: Some(2.0),
            bucket: Some("abc".to_string()),
            is_global: false,
        };
        limiter.update("PATCH /channels/1/messages", &info, now);

        let delay = limiter
            .delay_for("PATCH /channels/1/messages", now)
            .expect("bucket exhausted");
        assert!(delay <= Duration::from_secs(2));
        assert!(limiter.delay_for("GET /channels/1", now).is_none());
    }

    #[test]
    fn global_limit_blocks_every_route() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();
        let info = RateLimitInfo {
            reset_after: Some(1.0),
            is_global: true,
            ..Default::default()
        };
        limiter.update("any", &info, now);
        assert!(limiter.delay_for("other", now).is_some());
        assert!(limiter
            .delay_for("other", now + Duration::from_secs(2))
            .is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let client = DiscordHttpClient::new("secret-token").unwrap();
        let out = format!("{:?}", client);
        assert!(!out.contains("secret-token"));
    }

    #[tokio::test]
    async fn edit_message_patches_channel_message() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/channels/100/messages/200")
                    .header("authorization", "Bot tok")
                    .json_body(serde_json::json!({ "content": "done", "components": [] }));
                then.status(200).json_body(serde_json::json!({
                    "id": "200",
                    "channel_id": "100",
                    "content": "done",
                }));
            })
            .await;

        let client = DiscordHttpClient::with_base_url("tok", server.base_url()).unwrap();
        let edit = EditMessage::new().content("done").clear_components();
        let msg = client.edit_message("100", "200", &edit).await.unwrap();

        mock.assert_async().await;
        assert_eq!(msg.id, "200");
        assert!(msg.components.is_empty());
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_route() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/channels/9");
                then.status(403).body("Missing Access");
            })
            .await;

        let client = DiscordHttpClient::with_base_url("tok", server.base_url()).unwrap();
        let err = client.get_channel("9").await.unwrap_err();
        match err {
            HttpError::Api { status, body, route } => {
                assert_eq!(status, 403);
                assert_eq!(body, "Missing Access");
                assert_eq!(route, "GET /channels/9");
            }
            other => panic!("expected Api error, got {other}"),
        }
    }

    #[tokio::test]
    async fn guild_scope_registers_in_every_guild() {
        let server = MockServer::start_async().await;
        let mut mocks = Vec::new();
        for guild in ["1", "2"] {
            let path = format!("/applications/app/guilds/{}/commands", guild);
            mocks.push(
                server
                    .mock_async(|when, then| {
                        when.method(PUT).path(path);
                        then.status(200).json_body(serde_json::json!([
                            { "id": "c", "name": "start", "description": "GPU 사용 시작!!", "type": 1 }
                        ]));
                    })
                    .await,
            );
        }

        let client = DiscordHttpClient::with_base_url("tok", server.base_url()).unwrap();
        let cmds = [ApplicationCommand::chat_input("start", "GPU 사용 시작!!")];
        let scope = CommandScope::Guilds(vec!["1".into(), "2".into()]);
        let count = client.register_commands("app", &scope, &cmds).await.unwrap();

        assert_eq!(count, 2);
        for mock in &mocks {
            mock.assert_async().await;
        }
    }
}
