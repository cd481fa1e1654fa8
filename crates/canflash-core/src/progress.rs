//! Progress and log events
//!
//! Every step of a running sequence is reported as a [`ProgressEvent`] to a
//! caller-supplied [`ProgressSink`]. Events are delivered while the sequence
//! executes, so a caller can render live progress.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CoreError, ResultCode};
use crate::topology::NodeAddress;

/// Named step of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStep {
    // Flashloader activation
    ActivateFlashloaderStart,
    BroadcastEnterFlashloader,
    RoutingSetup,
    EnterProgrammingSession,
    SecurityAccess,
    ActivateFlashloaderFinished,

    // Device information
    ReadDeviceInfoStart,
    ReadDeviceName,
    ReadFlashloaderInfo,
    ReadFlashBlocks,
    ReadInfoBlocks,
    ReadDeviceInfoFinished,

    // Update
    UpdateStart,
    UpdateNodeStart,
    FirmwareOpen,
    FirmwareSignature,
    FirmwareDeviceName,
    FirmwareErase,
    FirmwareTransfer,
    FirmwareExit,
    FirmwareCheck,
    ParameterSetSizeCheck,
    ParameterSetWrite,
    CertificateRead,
    CertificateWrite,
    SecurityStateWrite,
    UpdateNodeFinished,
    UpdateFinished,

    // Reset
    ResetStart,
    ResetNode,
    ResetBroadcast,
    ResetFinished,

    Aborted,
}

/// One reported step
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub step: ProgressStep,
    pub result: ResultCode,
    /// 0..=100, `None` when the step has no meaningful percentage
    pub percent: Option<u8>,
    pub node: Option<NodeAddress>,
    pub text: String,
}

impl ProgressEvent {
    pub fn new(step: ProgressStep, text: impl Into<String>) -> Self {
        Self {
            step,
            result: ResultCode::Ok,
            percent: None,
            node: None,
            text: text.into(),
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }

    pub fn with_node(mut self, node: NodeAddress) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_error(mut self, err: &CoreError) -> Self {
        self.result = err.result_code();
        self
    }

    pub fn with_result(mut self, result: ResultCode) -> Self {
        self.result = result;
        self
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, event: &ProgressEvent) {
        let node = event.node.map(|n| n.to_string()).unwrap_or_default();
        if event.result.is_ok() {
            tracing::info!(
                step = ?event.step,
                percent = ?event.percent,
                node = %node,
                "{}",
                event.text
            );
        } else {
            tracing::warn!(
                step = ?event.step,
                result = ?event.result,
                node = %node,
                "{}",
                event.text
            );
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ProgressEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl ProgressSink for CollectingSink {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sends events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn report(&self, event: &ProgressEvent) {
        // Receiver gone means nobody is rendering progress any more
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builders() {
        let node = NodeAddress {
            bus_id: 1,
            node_id: 2,
        };
        let event = ProgressEvent::new(ProgressStep::FirmwareTransfer, "block 3")
            .with_percent(150)
            .with_node(node)
            .with_error(&CoreError::Aborted);

        assert_eq!(event.percent, Some(100));
        assert_eq!(event.node, Some(node));
        assert_eq!(event.result, ResultCode::Aborted);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.report(&ProgressEvent::new(ProgressStep::ResetStart, "a"));
        sink.report(&ProgressEvent::new(ProgressStep::ResetFinished, "b"));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_closure_sink() {
        let count = std::sync::atomic::AtomicUsize::new(0);
        let sink = |_: &ProgressEvent| {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };
        sink.report(&ProgressEvent::new(ProgressStep::UpdateStart, ""));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new();
        sink.report(&ProgressEvent::new(ProgressStep::UpdateStart, "go"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.text, "go");
    }
}
