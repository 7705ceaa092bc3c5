use crossbeam_channel::{unbounded, Receiver, Sender};

/// Output channel for callers waiting on a schema change
#[derive(Debug, Clone)]
pub struct ReportSink(Sender<String>);

impl ReportSink {
    pub fn channel() -> (ReportSink, Receiver<String>) {
        let (tx, rx) = unbounded();
        (ReportSink(tx), rx)
    }

    /// Lines sent after the receiver is gone are dropped
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.0.send(line.into());
    }
}
