//! Framed-stream endpoint over a duplex byte buffer.
//!
//! One endpoint sits between a byte transport (usually a capture worker's
//! stdio) and an owner that thinks in whole frames. The transport side
//! feeds raw reads into [`FramedEndpoint::on_bytes_available`] and drains
//! serialized frames with [`FramedEndpoint::next_outbound`]; the owner
//! receives decoded frames through its handler and writes with
//! [`FramedEndpoint::write_frame`].
//!
//! The outbound side is bounded: writers get [`EndpointError::WouldBlock`]
//! when the buffer is full. Closing drains the outbound buffer before the
//! transport observes end-of-stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{self, DecodeError, Decoded, EncodeError};
use crate::frame::Frame;

/// Why an endpoint stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Deliberate teardown by the owner.
    Shutdown,
    /// The inbound stream violated the framing protocol.
    ProtocolError,
    /// The transport hit end-of-stream or an I/O failure.
    TransportEof,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::ProtocolError => write!(f, "protocol_error"),
            CloseReason::TransportEof => write!(f, "transport_eof"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("outbound buffer full")]
    WouldBlock,
    #[error("endpoint closed ({0})")]
    Closed(CloseReason),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Buffer sizing for one endpoint.
#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    /// Cap on unconsumed inbound bytes; a frame larger than this can never
    /// complete and is treated as a protocol error.
    pub inbound_buffer_bytes: usize,
    /// Cap on serialized-but-unsent outbound bytes.
    pub outbound_buffer_bytes: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            inbound_buffer_bytes: 512 * 1024,
            outbound_buffer_bytes: 256 * 1024,
        }
    }
}

/// Owner-supplied whole-frame handler.
pub type FrameHandler = Box<dyn FnMut(Frame) + Send>;

struct Outbound {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    closing: bool,
}

pub struct FramedEndpoint {
    config: EndpointConfig,
    inbound: Mutex<BytesMut>,
    handler: Mutex<FrameHandler>,
    outbound: Mutex<Outbound>,
    outbound_cv: Condvar,
    closed: Mutex<Option<CloseReason>>,
    next_seqno: AtomicU32,
}

impl FramedEndpoint {
    pub fn new(config: EndpointConfig, handler: FrameHandler) -> Self {
        Self {
            config,
            inbound: Mutex::new(BytesMut::new()),
            handler: Mutex::new(handler),
            outbound: Mutex::new(Outbound {
                chunks: VecDeque::new(),
                buffered: 0,
                closing: false,
            }),
            outbound_cv: Condvar::new(),
            closed: Mutex::new(None),
            next_seqno: AtomicU32::new(1),
        }
    }

    /// Ingests newly arrived transport bytes, delivering every frame that
    /// completes. A partially arrived frame is retained verbatim until the
    /// rest of it shows up.
    pub fn on_bytes_available(&self, chunk: &[u8]) {
        if self.close_reason().is_some() {
            return;
        }

        let mut complete = Vec::new();
        let mut failure: Option<DecodeError> = None;
        {
            let mut inbound = self.inbound.lock();
            if inbound.len() + chunk.len() > self.config.inbound_buffer_bytes {
                warn!(
                    buffered = inbound.len(),
                    arrived = chunk.len(),
                    "inbound buffer overrun"
                );
                failure = Some(DecodeError::KvTooLong);
            } else {
                inbound.extend_from_slice(chunk);
                loop {
                    match codec::decode(&inbound[..]) {
                        Ok(Decoded::Frame { frame, consumed }) => {
                            let _ = inbound.split_to(consumed);
                            complete.push(frame);
                        }
                        Ok(Decoded::Need(_)) => break,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if !complete.is_empty() {
            let mut handler = self.handler.lock();
            for frame in complete {
                handler(frame);
            }
        }

        if let Some(e) = failure {
            warn!(error = %e, "closing endpoint on framing failure");
            self.close(CloseReason::ProtocolError);
        }
    }

    /// Serializes a frame onto the outbound buffer, assigning the next
    /// sequence number when the frame carries 0.
    pub fn write_frame(&self, mut frame: Frame) -> Result<(), EndpointError> {
        if let Some(reason) = self.close_reason() {
            return Err(EndpointError::Closed(reason));
        }
        if frame.seqno == 0 {
            frame.seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        }
        let wire = codec::encode(&frame)?;

        let mut outbound = self.outbound.lock();
        if outbound.closing {
            return Err(EndpointError::Closed(CloseReason::Shutdown));
        }
        if outbound.buffered + wire.len() > self.config.outbound_buffer_bytes {
            return Err(EndpointError::WouldBlock);
        }
        outbound.buffered += wire.len();
        outbound.chunks.push_back(wire);
        self.outbound_cv.notify_one();
        Ok(())
    }

    /// Stops the endpoint. The first reason wins; later calls are no-ops.
    /// Outbound bytes already buffered remain drainable.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason);
        }
        debug!(%reason, "endpoint closed");
        let mut outbound = self.outbound.lock();
        outbound.closing = true;
        self.outbound_cv.notify_all();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.lock()
    }

    /// Transport side: blocks for the next serialized chunk. Returns `None`
    /// once the endpoint is closed and the outbound buffer has drained,
    /// which is the transport's cue to signal end-of-stream.
    pub fn next_outbound(&self) -> Option<Bytes> {
        let mut outbound = self.outbound.lock();
        loop {
            if let Some(chunk) = outbound.chunks.pop_front() {
                outbound.buffered -= chunk.len();
                return Some(chunk);
            }
            if outbound.closing {
                return None;
            }
            self.outbound_cv.wait(&mut outbound);
        }
    }

    /// Non-blocking variant of [`next_outbound`](Self::next_outbound).
    pub fn try_next_outbound(&self) -> Option<Bytes> {
        let mut outbound = self.outbound.lock();
        let chunk = outbound.chunks.pop_front()?;
        outbound.buffered -= chunk.len();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::msg;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn endpoint_with_channel() -> (Arc<FramedEndpoint>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel();
        let endpoint = Arc::new(FramedEndpoint::new(
            EndpointConfig::default(),
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        ));
        (endpoint, rx)
    }

    #[test]
    fn partial_frame_retained_until_complete() {
        let (endpoint, rx) = endpoint_with_channel();
        let wire = codec::encode(&Frame::new(msg::HELLO).with_transaction(3)).unwrap();

        let (head, tail) = wire.split_at(wire.len() / 2);
        endpoint.on_bytes_available(head);
        assert!(rx.try_recv().is_err());
        endpoint.on_bytes_available(tail);
        assert_eq!(rx.try_recv().unwrap().frame_type, msg::HELLO);
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let (endpoint, rx) = endpoint_with_channel();
        let mut stream = codec::encode(&Frame::new(msg::HELLO)).unwrap().to_vec();
        stream.extend_from_slice(&codec::encode(&Frame::new(msg::DATA)).unwrap());

        endpoint.on_bytes_available(&stream);
        assert_eq!(rx.try_recv().unwrap().frame_type, msg::HELLO);
        assert_eq!(rx.try_recv().unwrap().frame_type, msg::DATA);
    }

    #[test]
    fn framing_failure_closes_with_protocol_error() {
        let (endpoint, rx) = endpoint_with_channel();
        endpoint.on_bytes_available(&[0x55u8; 32]);
        assert_eq!(endpoint.close_reason(), Some(CloseReason::ProtocolError));
        assert!(rx.try_recv().is_err());

        // A closed endpoint ignores further bytes and rejects writes.
        endpoint.on_bytes_available(&codec::encode(&Frame::new(msg::HELLO)).unwrap());
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            endpoint.write_frame(Frame::new(msg::LIST)),
            Err(EndpointError::Closed(CloseReason::ProtocolError))
        ));
    }

    #[test]
    fn outbound_cap_signals_would_block() {
        let endpoint = FramedEndpoint::new(
            EndpointConfig {
                inbound_buffer_bytes: 1024,
                outbound_buffer_bytes: 64,
            },
            Box::new(|_| {}),
        );
        assert!(endpoint.write_frame(Frame::new(msg::LIST)).is_ok());
        assert_eq!(
            endpoint.write_frame(Frame::new(msg::LIST)),
            Err(EndpointError::WouldBlock)
        );
        // Draining frees the buffer again.
        assert!(endpoint.try_next_outbound().is_some());
        assert!(endpoint.write_frame(Frame::new(msg::LIST)).is_ok());
    }

    #[test]
    fn close_drains_outbound_then_eof() {
        let endpoint = FramedEndpoint::new(EndpointConfig::default(), Box::new(|_| {}));
        endpoint.write_frame(Frame::new(msg::PROBE)).unwrap();
        endpoint.write_frame(Frame::new(msg::OPEN)).unwrap();
        endpoint.close(CloseReason::Shutdown);

        assert!(endpoint.next_outbound().is_some());
        assert!(endpoint.next_outbound().is_some());
        assert_eq!(endpoint.next_outbound(), None);
    }

    #[test]
    fn sequence_numbers_assigned_monotonically() {
        let endpoint = FramedEndpoint::new(EndpointConfig::default(), Box::new(|_| {}));
        endpoint.write_frame(Frame::new(msg::PROBE)).unwrap();
        endpoint.write_frame(Frame::new(msg::OPEN)).unwrap();

        let first = codec::decode(&endpoint.try_next_outbound().unwrap()).unwrap();
        let second = codec::decode(&endpoint.try_next_outbound().unwrap()).unwrap();
        match (first, second) {
            (Decoded::Frame { frame: a, .. }, Decoded::Frame { frame: b, .. }) => {
                assert_eq!(a.seqno, 1);
                assert_eq!(b.seqno, 2);
            }
            other => panic!("expected two frames, got {:?}", other),
        }
    }

    #[test]
    fn first_close_reason_wins() {
        let endpoint = FramedEndpoint::new(EndpointConfig::default(), Box::new(|_| {}));
        endpoint.close(CloseReason::TransportEof);
        endpoint.close(CloseReason::Shutdown);
        assert_eq!(endpoint.close_reason(), Some(CloseReason::TransportEof));
    }
}
