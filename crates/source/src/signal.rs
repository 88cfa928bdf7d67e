//! Control signals delivered to a running source.

use std::fmt::{Display, Formatter};

use tokio::sync::mpsc::Receiver;

/// The control signals a source can receive from the runtime.
#[derive(Debug)]
#[non_exhaustive]
pub enum Signal {
    /// The source must stop pulling and return from its run method.
    Stop,
}

/// Set of methods exposed by a signal.
impl Signal {
    /// Returns the name of this signal.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Stop => "Stop",
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The receiving end of the runtime-to-source control channel. A closed
/// channel reads as a stop request.
pub struct SignalReceiver {
    receiver: Receiver<Signal>,
}

impl SignalReceiver {
    /// Creates a signal receiver over a control channel.
    pub fn with_receiver(receiver: Receiver<Signal>) -> Self {
        Self { receiver }
    }

    /// Returns the next signal to process.
    pub async fn recv(&mut self) -> Signal {
        match self.receiver.recv().await {
            Some(signal) => signal,
            None => Signal::Stop,
        }
    }

    /// Returns a pending stop request without suspending, when one exists.
    pub fn try_recv(&mut self) -> Option<Signal> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod test {
    use crate::signal::{Signal, SignalReceiver};

    #[tokio::test]
    async fn closed_channel_reads_as_stop() {
        let (sender, receiver) = tokio::sync::mpsc::channel(1);
        let mut signals = SignalReceiver::with_receiver(receiver);

        sender.send(Signal::Stop).await.unwrap();
        drop(sender);

        assert!(matches!(signals.recv().await, Signal::Stop));
        assert!(matches!(signals.recv().await, Signal::Stop));
    }
}
