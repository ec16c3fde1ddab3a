use crate::error::StreamError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_INSTRUMENT: &str = "banknifty";
pub const DEFAULT_PRICE_WINDOW: usize = 50;
pub const DEFAULT_ERROR_WINDOW: usize = 50;
pub const DEFAULT_ANOMALY_LOG_CAPACITY: usize = 15;
/// Fixed Youden's J detection threshold used by the backend model.
pub const DEFAULT_DETECTION_THRESHOLD: f64 = 0.000087;
/// Probe string sent once immediately after the feed connection opens.
pub const KEEPALIVE_PROBE: &str = "ping";
pub const MIN_WINDOW_CAPACITY: usize = 1;
pub const MAX_WINDOW_CAPACITY: usize = 10_000;

/// Lifecycle of the single live feed connection owned by the controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

/// One decoded observation from the live feed.
///
/// `score` is absent while the upstream model is still warming up; without a
/// score the event contributes nothing to the error series or the anomaly log.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub timestamp: String,
    pub price: f64,
    pub score: Option<f64>,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub timestamp: String,
    pub value: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPoint {
    pub timestamp: String,
    pub reconstruction_error: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    pub timestamp: String,
    pub score: f64,
}

/// Immutable view of all derived state, safe to hand to renderers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub phase: SessionPhase,
    pub is_active: bool,
    pub price_series: Vec<PricePoint>,
    pub error_series: Vec<ErrorPoint>,
    pub anomaly_log: Vec<AnomalyRecord>,
    /// Presentation reference line over the visible price window,
    /// `min + 0.7 * (max - min)`. Absent while the window is empty.
    pub price_reference: Option<f64>,
    pub error_threshold: f64,
    pub last_error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObservationWire {
    #[serde(default)]
    pub close: Option<f64>,
}

/// Raw shape of one feed frame. The backend reuses the same envelope for
/// data rows, its post-accept welcome frame (null `timestamp`), and upstream
/// fault reports (`error` set).
#[derive(Debug, Deserialize)]
pub struct EnvelopeWire {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub data: Option<ObservationWire>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub anomaly: bool,
}

/// Classified feed frame after envelope validation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(StreamEvent),
    /// The feed reported a fault; surfaced as a visible message, the session
    /// continues.
    Upstream(String),
    /// Welcome/keep-alive chatter carrying no observation; dropped silently.
    Control,
}

impl From<EnvelopeWire> for StreamFrame {
    fn from(wire: EnvelopeWire) -> Self {
        if let Some(message) = wire.error {
            return Self::Upstream(message);
        }

        let Some(timestamp) = wire.timestamp else {
            return Self::Control;
        };

        // A missing close is a deliberate zero fallback, not a decode failure.
        let price = wire.data.and_then(|data| data.close).unwrap_or(0.0);

        Self::Event(StreamEvent {
            timestamp,
            price,
            score: wire.score,
            is_anomaly: wire.anomaly,
        })
    }
}

pub fn decode_stream_payload(payload: &mut [u8]) -> Result<StreamFrame, StreamError> {
    let wire: EnvelopeWire = simd_json::serde::from_slice(payload)?;
    Ok(wire.into())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamClientArgs {
    pub base_url: Option<String>,
    pub instrument: Option<String>,
    pub price_window: Option<usize>,
    pub error_window: Option<usize>,
    pub anomaly_log_capacity: Option<usize>,
    pub detection_threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub instrument: String,
    pub price_window: usize,
    pub error_window: usize,
    pub anomaly_log_capacity: usize,
    pub detection_threshold: f64,
}

impl StreamClientArgs {
    pub fn normalize(self) -> Result<ClientConfig, StreamError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(StreamError::InvalidArgument(
                "baseUrl must start with http:// or https://".to_string(),
            ));
        }

        let instrument = self
            .instrument
            .unwrap_or_else(|| DEFAULT_INSTRUMENT.to_string())
            .trim()
            .to_ascii_lowercase();

        if instrument.is_empty() || !instrument.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(StreamError::InvalidArgument(
                "instrument must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let price_window = self.price_window.unwrap_or(DEFAULT_PRICE_WINDOW);
        let error_window = self.error_window.unwrap_or(DEFAULT_ERROR_WINDOW);
        let anomaly_log_capacity = self
            .anomaly_log_capacity
            .unwrap_or(DEFAULT_ANOMALY_LOG_CAPACITY);
        for (name, capacity) in [
            ("priceWindow", price_window),
            ("errorWindow", error_window),
            ("anomalyLogCapacity", anomaly_log_capacity),
        ] {
            if !(MIN_WINDOW_CAPACITY..=MAX_WINDOW_CAPACITY).contains(&capacity) {
                return Err(StreamError::InvalidArgument(format!(
                    "{name} must be between {MIN_WINDOW_CAPACITY} and {MAX_WINDOW_CAPACITY}"
                )));
            }
        }

        let detection_threshold = self
            .detection_threshold
            .unwrap_or(DEFAULT_DETECTION_THRESHOLD);
        if !detection_threshold.is_finite() || detection_threshold < 0.0 {
            return Err(StreamError::InvalidArgument(
                "detectionThreshold must be a finite non-negative number".to_string(),
            ));
        }

        Ok(ClientConfig {
            base_url,
            instrument,
            price_window,
            error_window,
            anomaly_log_capacity,
            detection_threshold,
        })
    }
}
