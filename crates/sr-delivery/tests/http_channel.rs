//! HTTP channel client against a mock webhook endpoint.

use chrono::Utc;
use serde_json::json;
use sr_common::{NewEntry, OutboxEntry, SendOutcome};
use sr_config::{ChannelConfig, ConfigHandle, RelayConfig};
use sr_delivery::{ChannelClient, HttpChannelClient};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(url: String) -> HttpChannelClient {
    let mut config = RelayConfig::default();
    config.channels.push(ChannelConfig::new("1", url));
    HttpChannelClient::new(ConfigHandle::new(config).unwrap()).unwrap()
}

fn entry(channel: &str) -> OutboxEntry {
    OutboxEntry::new(
        NewEntry::new(channel, "evt:A", json!({"text": "BTC breakout"})),
        Utc::now(),
    )
}

#[tokio::test]
async fn test_success_posts_payload_with_headers() {
    let server = MockServer::start().await;
    let entry = entry("1");

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("X-Event-Key", "evt:A"))
        .and(header("X-Entry-Id", entry.id.as_str()))
        .and(body_json(json!({"text": "BTC breakout"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(format!("{}/hook", server.uri()));
    assert_eq!(client.send(&entry).await, SendOutcome::Ok);
}

#[tokio::test]
async fn test_429_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let client = client_for(server.uri());
    assert_eq!(
        client.send(&entry("1")).await,
        SendOutcome::RateLimited {
            retry_after: Some(Duration::from_secs(3))
        }
    );
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("chat not found"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let bad = client_for(format!("{}/bad", server.uri()));
    assert_eq!(
        bad.send(&entry("1")).await,
        SendOutcome::ClientError {
            code: 400,
            message: "chat not found".into()
        }
    );

    let down = client_for(format!("{}/down", server.uri()));
    assert!(matches!(
        down.send(&entry("1")).await,
        SendOutcome::ServerError { code: 503, .. }
    ));
}

#[tokio::test]
async fn test_unknown_channel_is_a_client_error() {
    let client = client_for("http://127.0.0.1:9".into());
    assert!(matches!(
        client.send(&entry("nope")).await,
        SendOutcome::ClientError { code: 404, .. }
    ));
}

#[tokio::test]
async fn test_connection_refused_is_a_network_error() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = client_for(format!("http://127.0.0.1:{port}/hook"));
    assert!(matches!(
        client.send(&entry("1")).await,
        SendOutcome::Network { .. }
    ));
}
