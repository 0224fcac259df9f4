//! Frame transport between the two reconnect peers.
//!
//! A reconnect stream is reliable and ordered, carrying opaque frames. Both
//! roles send and receive concurrently from separate tasks, so the stream is
//! split into a shareable [`FrameSender`] and an exclusive [`FrameReceiver`].
//!
//! [`channel::duplex`] provides an in-memory pair so the protocol code runs
//! unchanged in tests and in the simulator:
//!
//! ```text
//!   learner                         teacher
//!   ChannelSender ──── frames ────► ChannelReceiver
//!   ChannelReceiver ◄── frames ──── ChannelSender
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result as EyreResult;

#[async_trait]
pub trait FrameSender: Send + Sync {
    /// # Errors
    ///
    /// Fails if the peer has gone away or the stream was closed locally.
    async fn send(&self, frame: Bytes) -> EyreResult<()>;

    /// Signal the end of the stream. Frames already sent are still
    /// delivered; the peer's receiver then reports `None`.
    fn close(&self);
}

#[async_trait]
pub trait FrameReceiver: Send {
    /// Returns `Ok(None)` once the peer closed the stream.
    async fn recv(&mut self) -> EyreResult<Option<Bytes>>;
}

pub mod channel {
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{async_trait, Bytes, EyreResult, FrameReceiver, FrameSender};
    use crate::error::ReconnectError;

    /// Default number of frames buffered per direction.
    pub const DEFAULT_CAPACITY: usize = 256;

    #[derive(Debug)]
    pub struct ChannelSender {
        // Option so the stream can be closed while other tasks still hold
        // a reference to the sender.
        tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    }

    #[derive(Debug)]
    pub struct ChannelReceiver {
        rx: mpsc::Receiver<Bytes>,
    }

    /// One side of an in-memory stream.
    #[derive(Debug)]
    pub struct Endpoint {
        pub sender: ChannelSender,
        pub receiver: ChannelReceiver,
    }

    /// Create two connected endpoints. Each direction buffers `capacity`
    /// frames before `send` waits.
    #[must_use]
    pub fn duplex(capacity: usize) -> (Endpoint, Endpoint) {
        let (tx_a, rx_b) = mpsc::channel(capacity.max(1));
        let (tx_b, rx_a) = mpsc::channel(capacity.max(1));

        let a = Endpoint {
            sender: ChannelSender::new(tx_a),
            receiver: ChannelReceiver { rx: rx_a },
        };
        let b = Endpoint {
            sender: ChannelSender::new(tx_b),
            receiver: ChannelReceiver { rx: rx_b },
        };

        (a, b)
    }

    impl ChannelSender {
        #[must_use]
        pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
            Self {
                tx: Mutex::new(Some(tx)),
            }
        }
    }

    impl ChannelReceiver {
        #[must_use]
        pub const fn new(rx: mpsc::Receiver<Bytes>) -> Self {
            Self { rx }
        }
    }

    #[async_trait]
    impl FrameSender for ChannelSender {
        async fn send(&self, frame: Bytes) -> EyreResult<()> {
            let Some(tx) = self.tx.lock().clone() else {
                return Err(ReconnectError::TransportClosed.into());
            };
            tx.send(frame)
                .await
                .map_err(|_| ReconnectError::TransportClosed)?;
            Ok(())
        }

        fn close(&self) {
            drop(self.tx.lock().take());
        }
    }

    #[async_trait]
    impl FrameReceiver for ChannelReceiver {
        async fn recv(&mut self) -> EyreResult<Option<Bytes>> {
            Ok(self.rx.recv().await)
        }
    }
}
