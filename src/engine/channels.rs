// Communication channels between the engine and its host
use super::types::{EngineCommand, EngineEvent};
use tokio::sync::mpsc;

/// Helper function to create engine channels
pub fn create_engine_channels() -> (
    mpsc::Sender<EngineCommand>,
    mpsc::Receiver<EngineCommand>,
    mpsc::Sender<EngineEvent>,
    mpsc::Receiver<EngineEvent>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(32);
    (cmd_tx, cmd_rx, event_tx, event_rx)
}
