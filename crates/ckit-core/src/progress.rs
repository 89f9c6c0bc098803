use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Receives progress notifications from a running tool.
///
/// Implementations must not block; a slow consumer should drop updates.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// Sink used when the caller did not ask for progress.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _update: ProgressUpdate) {}
}

/// Forwards updates into an unbounded channel.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, update: ProgressUpdate) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (sink, mut rx) = ChannelProgress::new();
        for i in 0..3 {
            sink.report(ProgressUpdate {
                progress: f64::from(i),
                total: Some(3.0),
                message: None,
            });
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().progress, f64::from(i));
        }
    }

    #[test]
    fn report_after_receiver_dropped_is_silent() {
        let (sink, rx) = ChannelProgress::new();
        drop(rx);
        sink.report(ProgressUpdate {
            progress: 1.0,
            total: None,
            message: Some("late".into()),
        });
    }
}
