use std::{future::Future, io, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    error::{CaptchaChallenge, RemoteError},
    protocol::{ApiEnvelope, LongPollEndpoint, OAuthTokenResponse},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Ordered form arguments of one remote method call.
pub type Args = Vec<(String, String)>;

pub const LONG_POLL_SERVER_METHOD: &str = "messages.getLongPollServer";

/// Builds an [`Args`] list from string-ish pairs.
pub fn args<K, V, I>(pairs: I) -> Args
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.to_string()))
        .collect()
}

/// The remote network's RPC surface as seen by one session.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Issues `method`. A call refused with a CAPTCHA is remembered as the one
    /// [`RemoteApi::retry`] replays.
    async fn call(&self, method: &str, args: Args) -> Result<Value, RemoteError>;

    /// Re-issues the last call refused with a CAPTCHA, attaching the answer if given.
    async fn retry(&self, captcha: Option<&CaptchaChallenge>) -> Result<Value, RemoteError>;

    async fn login_with_password(
        &self,
        username: &str,
        password: &str,
        captcha: Option<&CaptchaChallenge>,
    ) -> Result<String, RemoteError>;

    /// Performs one long-poll request and returns the raw response body.
    async fn long_poll(&self, endpoint: &LongPollEndpoint) -> Result<Vec<u8>, RemoteError>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    async fn set_token(&self, token: String);
}

/// Decodes the result of [`LONG_POLL_SERVER_METHOD`].
pub fn long_poll_endpoint_from(value: Value) -> Result<LongPollEndpoint, RemoteError> {
    serde_json::from_value(value).map_err(|err| {
        RemoteError::InternalError(format!("invalid long-poll server response: {err}"))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_url: String,
    pub api_version: String,
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub poll_wait_seconds: u64,
    pub poll_mode: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.vk.com".into(),
            api_version: "5.131".into(),
            oauth_url: "https://oauth.vk.com".into(),
            client_id: String::new(),
            client_secret: String::new(),
            poll_wait_seconds: 30,
            poll_mode: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub transport_attempts: usize,
    pub transport_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transport_attempts: 5,
            transport_delay: Duration::from_secs(1),
            rate_limit_delay: Duration::from_secs(1),
        }
    }
}

pub struct HttpRemoteClient {
    http: Client,
    config: RemoteConfig,
    policy: RetryPolicy,
    token: Mutex<Option<String>>,
    captcha_call: Mutex<Option<(String, Args)>>,
}

impl HttpRemoteClient {
    pub fn new(http: Client, config: RemoteConfig, policy: RetryPolicy) -> Self {
        Self {
            http,
            config,
            policy,
            token: Mutex::new(None),
            captcha_call: Mutex::new(None),
        }
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
            ..self
        }
    }

    async fn invoke(
        &self,
        method: &str,
        args: &Args,
        captcha: Option<&CaptchaChallenge>,
    ) -> Result<Value, RemoteError> {
        let mut rate_limit_retried = false;
        loop {
            let envelope = self.post_method(method, args, captcha).await?;
            match classify_envelope(envelope) {
                Err(RemoteError::RateLimited) if !rate_limit_retried => {
                    warn!(method, "remote: rate limited; re-issuing once after delay");
                    rate_limit_retried = true;
                    tokio::time::sleep(self.policy.rate_limit_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn post_method(
        &self,
        method: &str,
        args: &Args,
        captcha: Option<&CaptchaChallenge>,
    ) -> Result<ApiEnvelope, RemoteError> {
        let url = format!("{}/method/{method}", self.config.api_url.trim_end_matches('/'));
        let mut form = args.clone();
        form.push(("v".into(), self.config.api_version.clone()));
        if let Some(token) = self.token.lock().await.clone() {
            form.push(("access_token".into(), token));
        }
        if let Some(challenge) = captcha {
            form.push(("captcha_sid".into(), challenge.sid.clone()));
            form.push((
                "captcha_key".into(),
                challenge.answer.clone().unwrap_or_default(),
            ));
        }

        let body = self
            .send_with_retry(method, || {
                let request = self.http.post(&url).form(&form);
                async move { request.send().await?.bytes().await }
            })
            .await?;
        serde_json::from_slice(&body).map_err(|err| {
            RemoteError::InternalError(format!("undecodable response for {method}: {err}"))
        })
    }

    /// Runs `send` up to `transport_attempts` times, sleeping between connection-level failures.
    async fn send_with_retry<F, Fut, T>(&self, what: &str, mut send: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<T>>,
    {
        let attempts = self.policy.transport_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match send().await {
                Ok(value) => return Ok(value),
                Err(err) if is_network_unreachable(&err) => {
                    warn!(what, "remote: network unreachable: {err}");
                    return Err(RemoteError::NetworkUnreachable(err.to_string()));
                }
                Err(err) if err.is_builder() => {
                    return Err(RemoteError::Transport(err.to_string()));
                }
                Err(err) => {
                    warn!(what, attempt, max_attempts = attempts, "remote: transport failure: {err}");
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.transport_delay).await;
                    }
                }
            }
        }
        Err(RemoteError::Transport(last_error))
    }

    fn long_poll_url(&self, endpoint: &LongPollEndpoint) -> Result<Url, RemoteError> {
        let base = if endpoint.server.starts_with("http://") || endpoint.server.starts_with("https://") {
            endpoint.server.clone()
        } else {
            format!("https://{}", endpoint.server)
        };
        let mut url = Url::parse(&base)
            .map_err(|err| RemoteError::InternalError(format!("invalid long-poll server: {err}")))?;
        url.query_pairs_mut()
            .append_pair("act", "a_check")
            .append_pair("key", &endpoint.key)
            .append_pair("ts", &endpoint.ts.to_string())
            .append_pair("wait", &self.config.poll_wait_seconds.to_string())
            .append_pair("mode", &self.config.poll_mode.to_string());
        Ok(url)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteClient {
    async fn call(&self, method: &str, args: Args) -> Result<Value, RemoteError> {
        debug!(method, "remote: call");
        let result = self.invoke(method, &args, None).await;
        if matches!(result, Err(RemoteError::CaptchaRequired(_))) {
            *self.captcha_call.lock().await = Some((method.to_string(), args));
        }
        result
    }

    async fn retry(&self, captcha: Option<&CaptchaChallenge>) -> Result<Value, RemoteError> {
        let Some((method, args)) = self.captcha_call.lock().await.clone() else {
            return Err(RemoteError::InternalError("no captcha-interrupted call to retry".into()));
        };
        debug!(method = %method, with_captcha = captcha.is_some(), "remote: retry");
        self.invoke(&method, &args, captcha).await
    }

    async fn login_with_password(
        &self,
        username: &str,
        password: &str,
        captcha: Option<&CaptchaChallenge>,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/token", self.config.oauth_url.trim_end_matches('/'));
        let mut query = args([
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", username),
            ("password", password),
            ("v", self.config.api_version.as_str()),
        ]);
        if let Some(challenge) = captcha {
            query.push(("captcha_sid".into(), challenge.sid.clone()));
            query.push((
                "captcha_key".into(),
                challenge.answer.clone().unwrap_or_default(),
            ));
        }

        let body = self
            .send_with_retry("oauth.token", || {
                let request = self.http.get(&url).query(&query);
                async move { request.send().await?.bytes().await }
            })
            .await?;
        let response: OAuthTokenResponse = serde_json::from_slice(&body).map_err(|err| {
            RemoteError::InternalError(format!("undecodable token response: {err}"))
        })?;
        classify_token_response(response)
    }

    async fn long_poll(&self, endpoint: &LongPollEndpoint) -> Result<Vec<u8>, RemoteError> {
        let url = self.long_poll_url(endpoint)?;
        let timeout = Duration::from_secs(self.config.poll_wait_seconds + 10);
        let body = self
            .send_with_retry("long_poll", || {
                let request = self.http.get(url.clone()).timeout(timeout);
                async move { request.send().await?.bytes().await }
            })
            .await?;
        Ok(body.to_vec())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let body = self
            .send_with_retry("fetch_bytes", || {
                let request = self.http.get(url);
                async move { request.send().await?.error_for_status()?.bytes().await }
            })
            .await?;
        Ok(body.to_vec())
    }

    async fn set_token(&self, token: String) {
        *self.token.lock().await = Some(token);
    }
}

fn classify_envelope(envelope: ApiEnvelope) -> Result<Value, RemoteError> {
    if let Some(body) = envelope.error {
        return match RemoteError::from_api(&body) {
            Some(error) => Err(error),
            None => {
                debug!(code = body.error_code, "remote: soft error treated as empty result");
                Ok(Value::Null)
            }
        };
    }
    Ok(envelope.response.unwrap_or(Value::Null))
}

fn classify_token_response(response: OAuthTokenResponse) -> Result<String, RemoteError> {
    if let Some(token) = response.access_token {
        return Ok(token);
    }
    let description = response.error_description.unwrap_or_default();
    match response.error.as_deref() {
        Some("need_captcha") => {
            let sid = match response.captcha_sid {
                Some(Value::String(sid)) => sid,
                Some(Value::Number(sid)) => sid.to_string(),
                _ => String::new(),
            };
            Err(RemoteError::CaptchaRequired(CaptchaChallenge {
                sid,
                image_url: response.captcha_img.unwrap_or_default(),
                answer: None,
            }))
        }
        Some("invalid_client" | "invalid_grant" | "invalid_request") => {
            Err(RemoteError::CredentialsInvalid(description))
        }
        Some(other) => Err(RemoteError::Unknown {
            code: 0,
            message: format!("{other}: {description}"),
        }),
        None => Err(RemoteError::InternalError(
            "token response carried neither token nor error".into(),
        )),
    }
}

/// Whether any error in the source chain is an unreachable network or host.
fn is_network_unreachable(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        if let Some(io_error) = current.downcast_ref::<io::Error>() {
            if matches!(
                io_error.kind(),
                io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable
            ) {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
