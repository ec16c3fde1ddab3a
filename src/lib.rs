mod error;
pub mod stream;

pub use error::StreamError;
pub use stream::controller::{DashState, StreamClient};
pub use stream::types::{
    AnomalyRecord, ClientConfig, DashboardSnapshot, ErrorPoint, PricePoint, SessionPhase,
    StreamClientArgs, StreamEvent, StreamFrame,
};
pub use stream::window::{AnomalyLog, RollingWindow};
