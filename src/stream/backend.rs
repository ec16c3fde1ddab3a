use crate::error::StreamError;
use crate::stream::types::{AnomalyRecord, ClientConfig};
use reqwest::Client;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn health_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/health")
}

fn anomalies_endpoint(base_url: &str, instrument: &str) -> String {
    format!("{base_url}/api/anomalies/{instrument}")
}

fn start_endpoint(base_url: &str, instrument: &str) -> String {
    format!("{base_url}/api/start/{instrument}")
}

fn stop_endpoint(base_url: &str, instrument: &str) -> String {
    format!("{base_url}/api/stop/{instrument}")
}

fn ws_endpoint(base_url: &str, instrument: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{ws_base}/ws/{instrument}")
}

pub async fn connect_feed_stream(config: &ClientConfig) -> Result<FeedWsStream, StreamError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(&config.base_url, &config.instrument);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

/// Liveness probe consulted once before the first history query.
pub async fn probe_health(client: &Client, config: &ClientConfig) -> Result<(), StreamError> {
    let endpoint = health_endpoint(&config.base_url);
    client.get(endpoint).send().await?.error_for_status()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AnomalyHistoryWire {
    anomalies: Vec<AnomalyRecord>,
}

/// Fetches prior anomalies for the instrument, newest first (the backend
/// orders by timestamp descending with the log capacity as its limit).
pub async fn fetch_anomaly_history(
    client: &Client,
    config: &ClientConfig,
) -> Result<Vec<AnomalyRecord>, StreamError> {
    let endpoint = anomalies_endpoint(&config.base_url, &config.instrument);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<AnomalyHistoryWire>().await?;
    Ok(payload.anomalies)
}

#[derive(Debug, Deserialize)]
struct CommandDetailWire {
    #[serde(default)]
    detail: Option<String>,
}

pub async fn send_start_command(client: &Client, config: &ClientConfig) -> Result<(), StreamError> {
    post_command(client, start_endpoint(&config.base_url, &config.instrument)).await
}

pub async fn send_stop_command(client: &Client, config: &ClientConfig) -> Result<(), StreamError> {
    post_command(client, stop_endpoint(&config.base_url, &config.instrument)).await
}

async fn post_command(client: &Client, endpoint: String) -> Result<(), StreamError> {
    let response = client.post(endpoint).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    // Rejections carry a server-provided detail message; fall back to the
    // transport-level status text when the body is missing or unreadable.
    let status_text = status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string();
    let detail = response
        .json::<CommandDetailWire>()
        .await
        .ok()
        .and_then(|wire| wire.detail)
        .unwrap_or(status_text);

    Err(StreamError::Command {
        status: status.as_u16(),
        detail,
    })
}
