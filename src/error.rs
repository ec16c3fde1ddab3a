use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("payload decode error: {0}")]
    Decode(#[from] simd_json::Error),
    #[error("command rejected ({status}): {detail}")]
    Command { status: u16, detail: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
