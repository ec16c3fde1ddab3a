use crate::error::StreamError;
use crate::stream::backend::{
    connect_feed_stream, fetch_anomaly_history, probe_health, send_start_command,
    send_stop_command,
};
use crate::stream::session::{SessionEvent, SessionHandle};
use crate::stream::types::{
    decode_stream_payload, AnomalyRecord, ClientConfig, DashboardSnapshot, ErrorPoint, PricePoint,
    SessionPhase, StreamEvent, StreamFrame, KEEPALIVE_PROBE,
};
use crate::stream::window::{AnomalyLog, RollingWindow};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mutable dashboard state, owned by the controller and only ever borrowed by
/// the current session task. Survives stop/start so a restarted session keeps
/// filling the same views.
#[derive(Debug)]
pub struct DashState {
    pub phase: SessionPhase,
    pub price_series: RollingWindow<PricePoint>,
    pub error_series: RollingWindow<ErrorPoint>,
    pub anomaly_log: AnomalyLog,
    pub last_error: Option<String>,
}

impl DashState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            phase: SessionPhase::Idle,
            price_series: RollingWindow::new(config.price_window),
            error_series: RollingWindow::new(config.error_window),
            anomaly_log: AnomalyLog::new(config.anomaly_log_capacity),
            last_error: None,
        }
    }
}

/// Fans one validated event into the derived views: a price point always, an
/// error point only once the model reports a score, a log entry only for
/// scored anomalies. One call is one atomic update.
pub fn apply_stream_event(state: &mut DashState, event: &StreamEvent, threshold: f64) {
    state.price_series.push(PricePoint {
        timestamp: event.timestamp.clone(),
        value: event.price,
        is_anomaly: event.is_anomaly,
    });

    let Some(score) = event.score else {
        return;
    };

    state.error_series.push(ErrorPoint {
        timestamp: event.timestamp.clone(),
        reconstruction_error: score,
        threshold,
        is_anomaly: event.is_anomaly,
    });

    if event.is_anomaly {
        state.anomaly_log.record(AnomalyRecord {
            timestamp: event.timestamp.clone(),
            score,
        });
    }
}

/// Reference line for the price chart: 70% up the visible range. Purely a
/// presentation derivation over the current window.
pub fn price_reference(points: &[PricePoint]) -> Option<f64> {
    let first = points.first()?;
    let mut min = first.value;
    let mut max = first.value;
    for point in &points[1..] {
        min = min.min(point.value);
        max = max.max(point.value);
    }
    Some(min + 0.7 * (max - min))
}

pub fn build_snapshot(state: &DashState, detection_threshold: f64) -> DashboardSnapshot {
    let price_series = state.price_series.snapshot();
    let error_series = state.error_series.snapshot();

    DashboardSnapshot {
        phase: state.phase,
        is_active: state.phase.is_active(),
        price_reference: price_reference(&price_series),
        error_threshold: error_series
            .last()
            .map(|point| point.threshold)
            .unwrap_or(detection_threshold),
        anomaly_log: state.anomaly_log.snapshot(),
        price_series,
        error_series,
        last_error: state.last_error.clone(),
    }
}

fn publish_snapshot(
    snapshot_tx: &watch::Sender<DashboardSnapshot>,
    state: &Mutex<DashState>,
    detection_threshold: f64,
) {
    let snapshot = {
        let readable = state.lock();
        build_snapshot(&readable, detection_threshold)
    };
    snapshot_tx.send_replace(snapshot);
}

/// Controller for one instrument's streaming session. Owns the connection
/// slot, the dashboard state and the snapshot channel; presentation consumers
/// only ever see immutable [`DashboardSnapshot`] values.
pub struct StreamClient {
    config: ClientConfig,
    http: Client,
    state: Arc<Mutex<DashState>>,
    session: tokio::sync::Mutex<Option<SessionHandle>>,
    epoch: AtomicU64,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        let state = DashState::new(&config);
        let (snapshot_tx, _) = watch::channel(build_snapshot(&state, config.detection_threshold));

        Self {
            config,
            http: Client::new(),
            state: Arc::new(Mutex::new(state)),
            session: tokio::sync::Mutex::new(None),
            epoch: AtomicU64::new(0),
            snapshot_tx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Requests a live session: start command, history preload, then the feed
    /// connection. Returns `Ok(false)` when a session is already live (at
    /// most one connection per controller); a rejected start command leaves
    /// the session in its prior phase.
    pub async fn start(&self) -> Result<bool, StreamError> {
        let mut slot = self.session.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.join.is_finished() {
                debug!(epoch = handle.epoch, "start ignored, session already live");
                return Ok(false);
            }
        }
        *slot = None;

        if let Err(error) = send_start_command(&self.http, &self.config).await {
            self.record_error(format!("Failed to start streaming: {error}"));
            return Err(error);
        }

        {
            let mut writable = self.state.lock();
            writable.last_error = None;
            writable.phase = writable.phase.transition(SessionEvent::StartRequested);
        }
        self.publish();

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let runtime = SessionRuntime {
            config: self.config.clone(),
            http: self.http.clone(),
            state: Arc::clone(&self.state),
            snapshot_tx: self.snapshot_tx.clone(),
            cancel: cancel.clone(),
            epoch,
        };
        let join = tokio::spawn(runtime.run());
        *slot = Some(SessionHandle {
            epoch,
            cancel,
            join,
        });

        info!(epoch, instrument = %self.config.instrument, "stream session started");
        Ok(true)
    }

    /// Stops the live session. Idempotent: with no session in the slot this
    /// is a no-op returning `Ok(false)`. A rejected stop command is surfaced
    /// and the session stays live in its prior phase.
    pub async fn stop(&self) -> Result<bool, StreamError> {
        let mut slot = self.session.lock().await;
        let Some(handle) = slot.take() else {
            debug!("stop ignored, no live session");
            return Ok(false);
        };

        if let Err(error) = send_stop_command(&self.http, &self.config).await {
            warn!(epoch = handle.epoch, %error, "stop command rejected, session stays live");
            *slot = Some(handle);
            drop(slot);
            self.record_error(format!("Failed to stop streaming: {error}"));
            return Err(error);
        }

        {
            let mut writable = self.state.lock();
            writable.phase = writable.phase.transition(SessionEvent::StopRequested);
        }
        self.publish();

        handle.cancel.cancel();
        let _ = handle.join.await;

        {
            let mut writable = self.state.lock();
            writable.phase = writable.phase.transition(SessionEvent::TransportClosed);
        }
        self.publish();

        info!(epoch = handle.epoch, "stream session stopped");
        Ok(true)
    }

    /// Force-stops without the stop-command round trip. Called on teardown so
    /// no transport callback can fire into a dropped controller.
    pub async fn shutdown(&self) {
        let mut slot = self.session.lock().await;
        let Some(handle) = slot.take() else {
            return;
        };

        handle.cancel.cancel();
        let _ = handle.join.await;

        {
            let mut writable = self.state.lock();
            writable.phase = writable.phase.transition(SessionEvent::TransportClosed);
        }
        self.publish();
        info!(epoch = handle.epoch, "stream session torn down");
    }

    fn record_error(&self, message: String) {
        {
            let mut writable = self.state.lock();
            writable.last_error = Some(message);
        }
        self.publish();
    }

    fn publish(&self) {
        publish_snapshot(&self.snapshot_tx, &self.state, self.config.detection_threshold);
    }
}

/// One session task: preload history, open the feed, pump messages until the
/// transport closes or the controller cancels. Every await is raced against
/// the cancellation token so a stale resolution after stop() is discarded.
struct SessionRuntime {
    config: ClientConfig,
    http: Client,
    state: Arc<Mutex<DashState>>,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
    cancel: CancellationToken,
    epoch: u64,
}

impl SessionRuntime {
    async fn run(self) {
        self.preload_history().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return,
            connected = connect_feed_stream(&self.config) => match connected {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(epoch = self.epoch, %error, "feed connect failed");
                    self.apply(
                        SessionEvent::ConnectFailed,
                        Some(format!("WebSocket connection error: {error}")),
                    );
                    return;
                }
            },
        };

        self.apply(SessionEvent::TransportOpen, None);
        info!(epoch = self.epoch, instrument = %self.config.instrument, "feed connected");

        if let Err(error) = stream
            .send(Message::Text(KEEPALIVE_PROBE.to_string()))
            .await
        {
            // Probe failure is a transport fault; the transport follows up
            // with its own close notification.
            self.record_error(format!("WebSocket error: {error}"));
        }

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next_message = stream.next() => next_message,
            };

            let Some(frame_result) = frame else {
                self.apply(SessionEvent::TransportClosed, None);
                return;
            };

            match frame_result {
                Ok(Message::Text(text_payload)) => {
                    let mut owned_payload = text_payload.into_bytes();
                    self.handle_payload(owned_payload.as_mut_slice());
                }
                Ok(Message::Binary(mut binary_payload)) => {
                    self.handle_payload(binary_payload.as_mut_slice());
                }
                Ok(Message::Close(_)) => {
                    self.apply(SessionEvent::TransportClosed, None);
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    self.record_error(format!("WebSocket error: {error}"));
                }
            }
        }
    }

    /// One-time pre-population of the anomaly log. Independent of the
    /// transport: any failure degrades to an empty log plus a visible
    /// warning, distinguishing an unreachable backend from a failed fetch.
    /// A restarted session keeps the rows it already has instead of
    /// re-prepending the backend's.
    async fn preload_history(&self) {
        if !self.state.lock().anomaly_log.is_empty() {
            debug!(epoch = self.epoch, "anomaly log already populated, skipping history");
            return;
        }
        if let Err(error) = probe_health(&self.http, &self.config).await {
            warn!(epoch = self.epoch, %error, "backend health probe failed");
            self.record_error("Cannot connect to backend. Is the server running?".to_string());
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        match fetch_anomaly_history(&self.http, &self.config).await {
            Ok(records) => {
                if self.cancel.is_cancelled() {
                    return;
                }
                {
                    let mut writable = self.state.lock();
                    // Records arrive newest first; replay oldest first so the
                    // newest row keeps the front slot.
                    for record in records.into_iter().rev() {
                        writable.anomaly_log.record(record);
                    }
                }
                self.publish();
            }
            Err(error) => {
                warn!(epoch = self.epoch, %error, "anomaly history fetch failed");
                self.record_error("Failed to fetch anomaly log.".to_string());
            }
        }
    }

    fn handle_payload(&self, payload: &mut [u8]) {
        match decode_stream_payload(payload) {
            Ok(StreamFrame::Event(event)) => {
                {
                    let mut writable = self.state.lock();
                    apply_stream_event(&mut writable, &event, self.config.detection_threshold);
                }
                self.publish();
            }
            Ok(StreamFrame::Upstream(message)) => {
                warn!(epoch = self.epoch, %message, "feed reported upstream fault");
                self.record_error(format!("Backend error: {message}"));
            }
            Ok(StreamFrame::Control) => {
                debug!(epoch = self.epoch, "dropping control frame");
            }
            Err(error) => {
                // Malformed frame: surfaced and dropped, buffers untouched.
                warn!(epoch = self.epoch, %error, "failed to decode feed frame");
                self.record_error(format!("Malformed feed frame: {error}"));
            }
        }
    }

    fn apply(&self, event: SessionEvent, error_message: Option<String>) {
        {
            let mut writable = self.state.lock();
            writable.phase = writable.phase.transition(event);
            if let Some(message) = error_message {
                writable.last_error = Some(message);
            }
        }
        self.publish();
    }

    fn record_error(&self, message: String) {
        {
            let mut writable = self.state.lock();
            writable.last_error = Some(message);
        }
        self.publish();
    }

    fn publish(&self) {
        publish_snapshot(&self.snapshot_tx, &self.state, self.config.detection_threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::StreamClientArgs;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    fn test_config() -> ClientConfig {
        StreamClientArgs::default()
            .normalize()
            .expect("default args should normalize")
    }

    // Backend commands against this address fail fast with a refused
    // connection.
    fn unreachable_config() -> ClientConfig {
        StreamClientArgs {
            base_url: Some("http://127.0.0.1:9".to_string()),
            ..StreamClientArgs::default()
        }
        .normalize()
        .expect("unreachable args should normalize")
    }

    fn sample_event(timestamp: &str, price: f64, score: Option<f64>, is_anomaly: bool) -> StreamEvent {
        StreamEvent {
            timestamp: timestamp.to_string(),
            price,
            score,
            is_anomaly,
        }
    }

    #[test]
    fn fans_out_warmup_scored_and_anomalous_events() {
        let mut state = DashState::new(&test_config());
        apply_stream_event(&mut state, &sample_event("t1", 100.0, None, false), 0.05);
        apply_stream_event(&mut state, &sample_event("t2", 105.0, Some(0.02), false), 0.05);
        apply_stream_event(&mut state, &sample_event("t3", 200.0, Some(0.09), true), 0.05);

        assert_eq!(state.price_series.len(), 3);

        let errors = state.error_series.snapshot();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].timestamp, "t2");
        assert_eq!(errors[1].timestamp, "t3");
        assert!(errors.iter().all(|point| point.threshold == 0.05));

        let log = state.anomaly_log.snapshot();
        assert_eq!(
            log,
            vec![AnomalyRecord {
                timestamp: "t3".to_string(),
                score: 0.09,
            }]
        );
    }

    #[test]
    fn scoreless_event_never_touches_error_series_or_log() {
        let mut state = DashState::new(&test_config());
        apply_stream_event(&mut state, &sample_event("t1", 100.0, None, true), 0.05);

        assert_eq!(state.price_series.len(), 1);
        assert!(state.error_series.is_empty());
        assert!(state.anomaly_log.is_empty());
    }

    #[test]
    fn unflagged_scored_event_skips_the_log() {
        let mut state = DashState::new(&test_config());
        apply_stream_event(&mut state, &sample_event("t1", 100.0, Some(0.01), false), 0.05);

        assert_eq!(state.error_series.len(), 1);
        assert!(state.anomaly_log.is_empty());
    }

    #[test]
    fn history_preload_keeps_live_anomalies_in_front() {
        let mut state = DashState::new(&test_config());

        // Backend history arrives newest first.
        let history = vec![
            AnomalyRecord {
                timestamp: "t0b".to_string(),
                score: 0.6,
            },
            AnomalyRecord {
                timestamp: "t0a".to_string(),
                score: 0.5,
            },
        ];
        for record in history.into_iter().rev() {
            state.anomaly_log.record(record);
        }

        apply_stream_event(&mut state, &sample_event("t1", 120.0, Some(0.9), true), 0.05);

        let log = state.anomaly_log.snapshot();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].timestamp, "t1");
        assert_eq!(log[1].timestamp, "t0b");
        assert_eq!(log[2].timestamp, "t0a");
    }

    #[test]
    fn price_reference_sits_at_seventy_percent_of_range() {
        let points = vec![
            PricePoint {
                timestamp: "t1".to_string(),
                value: 100.0,
                is_anomaly: false,
            },
            PricePoint {
                timestamp: "t2".to_string(),
                value: 200.0,
                is_anomaly: false,
            },
        ];

        let reference = price_reference(&points).expect("non-empty window has a reference");
        assert!((reference - 170.0).abs() < 1e-9);
    }

    #[test]
    fn price_reference_is_absent_for_empty_window() {
        assert_eq!(price_reference(&[]), None);
    }

    #[test]
    fn price_reference_of_flat_window_is_the_value_itself() {
        let points = vec![PricePoint {
            timestamp: "t1".to_string(),
            value: 42.0,
            is_anomaly: false,
        }];
        assert_eq!(price_reference(&points), Some(42.0));
    }

    #[test]
    fn snapshot_threshold_falls_back_when_error_series_is_empty() {
        let config = test_config();
        let state = DashState::new(&config);

        let snapshot = build_snapshot(&state, config.detection_threshold);
        assert_eq!(snapshot.error_threshold, config.detection_threshold);
        assert_eq!(snapshot.price_reference, None);
        assert!(!snapshot.is_active);
        assert_eq!(snapshot.phase, SessionPhase::Idle);
    }

    #[test]
    fn snapshot_threshold_tracks_latest_error_point() {
        let config = test_config();
        let mut state = DashState::new(&config);
        apply_stream_event(&mut state, &sample_event("t1", 100.0, Some(0.01), false), 0.5);

        let snapshot = build_snapshot(&state, config.detection_threshold);
        assert_eq!(snapshot.error_threshold, 0.5);
    }

    #[test]
    fn views_survive_a_stop_start_round_trip() {
        let mut state = DashState::new(&test_config());
        state.phase = state.phase.transition(SessionEvent::StartRequested);
        state.phase = state.phase.transition(SessionEvent::TransportOpen);
        apply_stream_event(&mut state, &sample_event("t1", 100.0, Some(0.2), true), 0.05);

        state.phase = state.phase.transition(SessionEvent::StopRequested);
        state.phase = state.phase.transition(SessionEvent::TransportClosed);
        state.phase = state.phase.transition(SessionEvent::StartRequested);

        assert_eq!(state.phase, SessionPhase::Connecting);
        assert_eq!(state.price_series.len(), 1);
        assert_eq!(state.error_series.len(), 1);
        assert_eq!(state.anomaly_log.len(), 1);
    }

    fn test_runtime(config: &ClientConfig) -> (SessionRuntime, Arc<Mutex<DashState>>) {
        let state = Arc::new(Mutex::new(DashState::new(config)));
        let initial = build_snapshot(&state.lock(), config.detection_threshold);
        let (snapshot_tx, _) = watch::channel(initial);
        let runtime = SessionRuntime {
            config: config.clone(),
            http: Client::new(),
            state: Arc::clone(&state),
            snapshot_tx,
            cancel: CancellationToken::new(),
            epoch: 1,
        };
        (runtime, state)
    }

    #[tokio::test]
    async fn malformed_frame_leaves_every_buffer_untouched() {
        let config = test_config();
        let (runtime, state) = test_runtime(&config);

        let mut payload = b"definitely not json".to_vec();
        runtime.handle_payload(payload.as_mut_slice());

        let readable = state.lock();
        assert!(readable.price_series.is_empty());
        assert!(readable.error_series.is_empty());
        assert!(readable.anomaly_log.is_empty());
        assert!(readable.last_error.is_some());
    }

    #[tokio::test]
    async fn upstream_fault_surfaces_without_touching_buffers() {
        let config = test_config();
        let (runtime, state) = test_runtime(&config);

        let mut payload =
            br#"{"timestamp":"t1","error":"Model prediction failed: bad window"}"#.to_vec();
        runtime.handle_payload(payload.as_mut_slice());

        let readable = state.lock();
        assert!(readable.price_series.is_empty());
        assert_eq!(
            readable.last_error.as_deref(),
            Some("Backend error: Model prediction failed: bad window")
        );
    }

    #[tokio::test]
    async fn control_frame_is_dropped_silently() {
        let config = test_config();
        let (runtime, state) = test_runtime(&config);

        let mut payload =
            br#"{"type":"connection","timestamp":null,"data":null,"score":null}"#.to_vec();
        runtime.handle_payload(payload.as_mut_slice());

        let readable = state.lock();
        assert!(readable.price_series.is_empty());
        assert!(readable.last_error.is_none());
    }

    #[tokio::test]
    async fn second_start_is_a_noop_while_session_is_live() {
        let client = StreamClient::new(test_config());

        let cancel = CancellationToken::new();
        let held = cancel.clone();
        let join = tokio::spawn(async move { held.cancelled().await });
        *client.session.lock().await = Some(SessionHandle {
            epoch: 1,
            cancel: cancel.clone(),
            join,
        });

        let started = client
            .start()
            .await
            .expect("guarded start should not issue any request");
        assert!(!started);

        cancel.cancel();
    }

    #[tokio::test]
    async fn rejected_stop_command_leaves_the_session_live() {
        init_tracing();
        let client = StreamClient::new(unreachable_config());
        client.state.lock().phase = SessionPhase::Open;

        let cancel = CancellationToken::new();
        let held = cancel.clone();
        let join = tokio::spawn(async move { held.cancelled().await });
        *client.session.lock().await = Some(SessionHandle {
            epoch: 1,
            cancel: cancel.clone(),
            join,
        });

        let result = client.stop().await;
        assert!(result.is_err(), "rejected stop command must surface");

        assert!(
            client.session.lock().await.is_some(),
            "session slot must keep the live handle"
        );
        assert!(!cancel.is_cancelled());
        let snapshot = client.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Open);
        assert!(snapshot.is_active);
        assert!(snapshot
            .last_error
            .as_deref()
            .is_some_and(|message| message.starts_with("Failed to stop streaming")));

        cancel.cancel();
    }

    #[tokio::test]
    async fn restarted_session_skips_the_history_preload() {
        init_tracing();
        let config = test_config();
        let (runtime, state) = test_runtime(&config);
        state.lock().anomaly_log.record(AnomalyRecord {
            timestamp: "t0".to_string(),
            score: 0.4,
        });

        // Returns before any request once the log holds rows, so no backend
        // is contacted and nothing is re-prepended.
        runtime.preload_history().await;

        let readable = state.lock();
        assert_eq!(readable.anomaly_log.len(), 1);
        assert!(readable.last_error.is_none());
    }

    #[tokio::test]
    async fn stop_without_a_session_is_a_noop() {
        let client = StreamClient::new(test_config());
        let stopped = client.stop().await.expect("idle stop should not error");
        assert!(!stopped);
        assert!(!client.snapshot().is_active);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_pending_session() {
        let client = StreamClient::new(test_config());
        client.state.lock().phase = SessionPhase::Open;

        let cancel = CancellationToken::new();
        let held = cancel.clone();
        let join = tokio::spawn(async move { held.cancelled().await });
        *client.session.lock().await = Some(SessionHandle {
            epoch: 1,
            cancel,
            join,
        });

        client.shutdown().await;

        assert!(client.session.lock().await.is_none());
        let snapshot = client.snapshot();
        assert_eq!(snapshot.phase, SessionPhase::Closed);
        assert!(!snapshot.is_active);
    }

    #[tokio::test]
    async fn subscribers_observe_published_snapshots() {
        let client = StreamClient::new(test_config());
        let receiver = client.subscribe();

        {
            let mut writable = client.state.lock();
            apply_stream_event(
                &mut writable,
                &sample_event("t1", 100.0, Some(0.2), true),
                0.05,
            );
        }
        client.publish();

        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.price_series.len(), 1);
        assert_eq!(snapshot.anomaly_log.len(), 1);
        assert_eq!(snapshot.error_threshold, 0.05);
    }
}
