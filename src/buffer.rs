//! Frame buffering for gated admission phases.
//!
//! While a connection waits on a gate (authorization, or a document load)
//! its inbound frames accumulate in a [`FrameBacklog`]. The backlog has a
//! byte ceiling; a peer that keeps streaming into a stalled gate gets
//! terminated instead of eating unbounded memory.

use crate::connection::ConnEvent;
use std::future::Future;
use tokio::sync::mpsc;

/// Ordered frames captured while a gate was pending.
#[derive(Debug, Default)]
pub struct FrameBacklog {
    frames: Vec<Vec<u8>>,
    bytes: usize,
}

impl FrameBacklog {
    pub fn new() -> Self {
        FrameBacklog::default()
    }

    fn push(&mut self, frame: Vec<u8>) {
        self.bytes += frame.len();
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes held. The count carries across consecutive
    /// buffering phases that reuse the same backlog.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Drain the buffered frames in arrival order.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        std::mem::take(&mut self.frames)
    }
}

/// How a buffering phase ended.
#[derive(Debug, PartialEq, Eq)]
pub enum BufferVerdict<T> {
    /// The gate resolved with this value before anything went wrong.
    Gate(T),
    /// The gate itself failed.
    GateError(String),
    /// The peer disconnected while the gate was pending.
    ConnectionClosed,
    /// A non-binary payload arrived; the connection is unsalvageable.
    NonBinary,
    /// Admitting the next frame would have pushed the backlog past the
    /// ceiling. The offending frame was not buffered.
    Overflow { buffered: usize, ceiling: usize },
}

/// Buffer inbound frames into `backlog` until `gate` resolves or the
/// connection misbehaves. Pongs are ignored here; they only matter to the
/// keep-alive watchdog, which is not running yet during admission.
pub async fn buffer_until<T, G>(
    events: &mut mpsc::UnboundedReceiver<ConnEvent>,
    backlog: &mut FrameBacklog,
    ceiling: usize,
    gate: G,
) -> BufferVerdict<T>
where
    G: Future<Output = Result<T, String>>,
{
    tokio::pin!(gate);
    loop {
        // Biased toward the event channel: frames already queued when the
        // gate resolves still belong to this phase's backlog.
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(ConnEvent::Frame(frame)) => {
                    if backlog.bytes() + frame.len() > ceiling {
                        return BufferVerdict::Overflow {
                            buffered: backlog.bytes() + frame.len(),
                            ceiling,
                        };
                    }
                    backlog.push(frame);
                }
                Some(ConnEvent::Pong) => {}
                Some(ConnEvent::NonBinary) => return BufferVerdict::NonBinary,
                Some(ConnEvent::Closed) | None => return BufferVerdict::ConnectionClosed,
            },
            outcome = &mut gate => {
                return match outcome {
                    Ok(pass) => BufferVerdict::Gate(pass),
                    Err(e) => BufferVerdict::GateError(e),
                };
            }
        }
    }
}
