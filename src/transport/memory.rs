//! In-process transport pair for driving pipelines without sockets.

use tokio::sync::mpsc;

use super::{Transport, TransportError};

pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Two connected endpoints: whatever one sends, the other receives
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: Some(a_tx), rx: b_rx },
        MemoryTransport { tx: Some(b_tx), rx: a_rx },
    )
}

impl Transport for MemoryTransport {
    async fn send(&mut self, payload: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(payload).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
