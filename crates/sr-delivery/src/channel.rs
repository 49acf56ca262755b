//! Channel clients: the outbound edge of the relay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use sr_common::{OutboxEntry, SendOutcome};
use sr_config::ConfigHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

pub const EVENT_KEY_HEADER: &str = "X-Event-Key";
pub const ENTRY_ID_HEADER: &str = "X-Entry-Id";

/// Delivers one entry to its downstream channel.
///
/// Implementations classify every failure into a [`SendOutcome`]; they do
/// not retry on their own. The dispatcher bounds each call with a timeout.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn send(&self, entry: &OutboxEntry) -> SendOutcome;
}

/// Generic JSON webhook client: POSTs the payload to the channel's URL.
pub struct HttpChannelClient {
    client: reqwest::Client,
    config: ConfigHandle,
}

impl HttpChannelClient {
    pub fn new(config: ConfigHandle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("signal-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, config })
    }

    fn classify_status(status: StatusCode, headers: &HeaderMap, body: String) -> SendOutcome {
        let code = status.as_u16();

        if status.is_success() {
            SendOutcome::Ok
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            SendOutcome::RateLimited {
                retry_after: parse_retry_after(headers, Utc::now()),
            }
        } else if status.is_client_error() {
            SendOutcome::ClientError {
                code,
                message: summarize(&body, status),
            }
        } else {
            // 5xx and anything unexpected are worth another try
            SendOutcome::ServerError {
                code,
                message: summarize(&body, status),
            }
        }
    }
}

#[async_trait]
impl ChannelClient for HttpChannelClient {
    async fn send(&self, entry: &OutboxEntry) -> SendOutcome {
        let config = self.config.snapshot();
        let Some(channel) = config.channel(&entry.channel_id) else {
            warn!(
                entry_id = %entry.id,
                channel_id = %entry.channel_id,
                "No channel configured for entry"
            );
            return SendOutcome::ClientError {
                code: 404,
                message: format!("unknown channel: {}", entry.channel_id),
            };
        };

        debug!(entry_id = %entry.id, channel_id = %entry.channel_id, url = %channel.url, "Sending entry");

        let request = self
            .client
            .post(&channel.url)
            .header(EVENT_KEY_HEADER, &entry.event_key)
            .header(ENTRY_ID_HEADER, &entry.id)
            .json(&entry.payload);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let body = if status.is_success() {
                    String::new()
                } else {
                    response.text().await.unwrap_or_default()
                };
                Self::classify_status(status, &headers, body)
            }
            Err(e) if e.is_timeout() => SendOutcome::Timeout,
            Err(e) if e.is_connect() => SendOutcome::Network {
                message: format!("connection error: {}", e),
            },
            Err(e) => SendOutcome::Network {
                message: format!("request failed: {}", e),
            },
        }
    }
}

/// `Retry-After` as delta-seconds (fractional values accepted).
/// `Retry-After` as delay-seconds or an HTTP-date. A date already in the
/// past means no wait; values that do not fit a `Duration` are ignored.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn summarize(body: &str, status: StatusCode) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
    }
    body.chars().take(256).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, now), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_millis(1500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), None);
    }

    #[test]
    fn test_parse_retry_after_rejects_unrepresentable_delays() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        for raw in ["1e20", "-3", "inf", "NaN"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers, now), None, "Retry-After: {raw}");
        }
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(60)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:00:00 GMT"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_classify_status() {
        let headers = HeaderMap::new();
        assert_eq!(
            HttpChannelClient::classify_status(StatusCode::OK, &headers, String::new()),
            SendOutcome::Ok
        );
        assert_eq!(
            HttpChannelClient::classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, String::new()),
            SendOutcome::RateLimited { retry_after: None }
        );
        assert_eq!(
            HttpChannelClient::classify_status(StatusCode::BAD_REQUEST, &headers, "chat not found".into()),
            SendOutcome::ClientError {
                code: 400,
                message: "chat not found".into()
            }
        );
        assert_eq!(
            HttpChannelClient::classify_status(StatusCode::BAD_GATEWAY, &headers, String::new()),
            SendOutcome::ServerError {
                code: 502,
                message: "Bad Gateway".into()
            }
        );
    }
}
