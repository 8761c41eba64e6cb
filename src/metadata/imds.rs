use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MetadataError, MetadataSource};

const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
const ENDPOINT_ENV: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";

/// Settings for [`ImdsClient`].
#[derive(Debug, Clone)]
pub struct ImdsConfig {
    /// Base URL, without the `/latest` suffix
    pub endpoint: String,
    /// Total attempts per lookup, including the first
    pub max_attempts: u32,
    /// Backoff step; attempt `n` waits `n * backoff`, capped at `max_backoff`
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Per-request timeout
    pub timeout: Duration,
    pub token_ttl: Duration,
}

impl Default for ImdsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            // Lots of retries: plugins have no better strategy available.
            max_attempts: 20,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            token_ttl: Duration::from_secs(21600),
        }
    }
}

impl ImdsConfig {
    /// Defaults, with the endpoint overridable from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            if !endpoint.is_empty() {
                config.endpoint = endpoint.trim_end_matches('/').to_string();
            }
        }
        config
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        (self.backoff * attempt).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
enum Token {
    Unknown,
    Session(String),
    /// Service does not issue tokens; use unauthenticated requests.
    Disabled,
}

enum Attempt {
    Retry(MetadataError),
    Fatal(MetadataError),
}

/// HTTP client for the instance metadata service.
pub struct ImdsClient {
    http: reqwest::Client,
    config: ImdsConfig,
    token: Mutex<Token>,
}

impl ImdsClient {
    pub fn new(config: ImdsConfig) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .map_err(|e| MetadataError::Request {
                path: config.endpoint.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(Token::Unknown),
        })
    }

    async fn session_token(&self) -> Option<String> {
        let mut token = self.token.lock().await;
        match &*token {
            Token::Session(t) => return Some(t.clone()),
            Token::Disabled => return None,
            Token::Unknown => {}
        }

        let url = format!("{}/latest/api/token", self.config.endpoint);
        let resp = self
            .http
            .put(&url)
            .header(TOKEN_TTL_HEADER, self.config.token_ttl.as_secs().to_string())
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(t) => {
                    *token = Token::Session(t.clone());
                    Some(t)
                }
                Err(e) => {
                    debug!("failed to read metadata token: {}", e);
                    None
                }
            },
            Ok(resp)
                if matches!(
                    resp.status(),
                    StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
                ) =>
            {
                debug!("metadata tokens unavailable ({}), using IMDSv1", resp.status());
                *token = Token::Disabled;
                None
            }
            Ok(resp) => {
                debug!("metadata token request returned {}", resp.status());
                None
            }
            Err(e) => {
                debug!("metadata token request failed: {}", e);
                None
            }
        }
    }

    async fn try_get(&self, path: &str) -> Result<String, Attempt> {
        let url = format!("{}/latest/meta-data/{}", self.config.endpoint, path);
        let mut req = self.http.get(&url);
        if let Some(token) = self.session_token().await {
            req = req.header(TOKEN_HEADER, token);
        }

        let resp = req.send().await.map_err(|e| {
            Attempt::Retry(MetadataError::Request {
                path: path.to_string(),
                message: e.to_string(),
            })
        })?;

        let status = resp.status();
        if status.is_success() {
            return resp.text().await.map_err(|e| {
                Attempt::Retry(MetadataError::Request {
                    path: path.to_string(),
                    message: e.to_string(),
                })
            });
        }

        let err = MetadataError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        };
        match status {
            StatusCode::NOT_FOUND => Err(Attempt::Fatal(MetadataError::NotFound(path.to_string()))),
            StatusCode::UNAUTHORIZED => {
                *self.token.lock().await = Token::Unknown;
                Err(Attempt::Retry(err))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(Attempt::Retry(err))
            }
            _ => Err(Attempt::Fatal(err)),
        }
    }
}

#[async_trait]
impl MetadataSource for ImdsClient {
    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        let mut attempt = 1;
        loop {
            match self.try_get(path).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) if attempt >= self.config.max_attempts => {
                    warn!("giving up on metadata {} after {} attempts", path, attempt);
                    return Err(e);
                }
                Err(Attempt::Retry(e)) => {
                    debug!("metadata {} attempt {} failed: {}", path, attempt, e);
                    tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
