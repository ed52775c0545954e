//! Inbound reader loop.
//!
//! Owns the receive half of the connection. Each iteration issues exactly one
//! receive, decodes the frame and appends it to the [`MessageQueue`]; the next
//! receive is only issued after that. Any read error, a close frame, the end
//! of the stream, or the shutdown signal terminates the loop without retry
//! and without surfacing an error: consumers simply stop seeing new messages.

use crate::codec::decode_frame;
use crate::config::MalformedFramePolicy;
use crate::queue::MessageQueue;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, trace, warn};

/// Observable state of the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Created, first receive not yet issued.
    Idle,
    /// A receive is outstanding or a frame is being delivered.
    Reading,
    /// The loop has exited and will never append again.
    Terminated,
}

/// Outcome of handling a single frame.
enum Step {
    Continue,
    Stop,
}

pub(crate) struct ReaderLoop<S> {
    stream: S,
    queue: Arc<MessageQueue>,
    malformed_frames: MalformedFramePolicy,
    state: watch::Sender<ReaderState>,
    shutdown: watch::Receiver<bool>,
}

impl<S> ReaderLoop<S>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    pub(crate) fn new(
        stream: S,
        queue: Arc<MessageQueue>,
        malformed_frames: MalformedFramePolicy,
        state: watch::Sender<ReaderState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            queue,
            malformed_frames,
            state,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        self.state.send_replace(ReaderState::Reading);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    debug!("Reader loop stopped by shutdown signal");
                    break;
                }
                next = self.stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    if let Step::Stop = self.handle(message) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Reader loop terminated by read error: {}", e);
                    break;
                }
                None => {
                    debug!("Reader loop terminated: stream ended");
                    break;
                }
            }
        }

        self.state.send_replace(ReaderState::Terminated);
    }

    fn handle(&self, message: WsMessage) -> Step {
        let payload = match message {
            WsMessage::Text(text) => text.into_bytes(),
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Close(frame) => {
                debug!("Reader loop terminated by close frame: {:?}", frame);
                return Step::Stop;
            }
            // Control traffic is answered by tungstenite itself.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {
                return Step::Continue
            }
        };

        let value = match decode_frame(&payload) {
            Ok(value) => value,
            Err(e) => match self.malformed_frames {
                MalformedFramePolicy::Deliver => {
                    debug!("Delivering undecodable frame as null: {}", e);
                    serde_json::Value::Null
                }
                MalformedFramePolicy::Drop => {
                    warn!(
                        "Dropping undecodable frame ({} bytes): {}",
                        payload.len(),
                        e
                    );
                    return Step::Continue;
                }
            },
        };

        if self.queue.push(value) {
            Step::Continue
        } else {
            trace!("Queue closed, reader loop exiting");
            Step::Stop
        }
    }
}
