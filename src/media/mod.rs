//! Receiver-side media handling
//!
//! A [`TrackSource`] yields frames from a live track, the
//! [`pump::FrameIngestionPump`] drains it under an error budget, and each
//! frame ends up in exactly one sink.

pub mod pump;
pub mod queue;

pub use pump::{ErrorBudget, FrameIngestionPump, PumpReport, StopReason};
pub use queue::{FrameQueue, QueuedSink};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};

/// One media sample taken off a track
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the track, starting at 0
    pub sequence: u64,
    pub data: Bytes,
    /// RTP timestamp of the packets the sample was built from
    pub rtp_timestamp: u32,
    pub received_at: Instant,
}

impl Frame {
    pub fn new(sequence: u64, data: Bytes, rtp_timestamp: u32) -> Self {
        Self {
            sequence,
            data,
            rtp_timestamp,
            received_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame #{} ({} bytes, ts={})",
            self.sequence,
            self.data.len(),
            self.rtp_timestamp
        )
    }
}

/// Annotator output for one region of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// x, y, width, height in pixels
    pub bbox: [u32; 4],
}

/// Media errors
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("track ended")]
    TransportClosed,
    #[error("capture failure: {0}")]
    CaptureFailure(String),
    #[error("annotation failure: {0}")]
    AnnotationFailure(String),
    #[error("sink closed")]
    SinkClosed,
    #[error("sink error: {0}")]
    Sink(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// The track or its connection is gone for good
    pub fn is_teardown(&self) -> bool {
        matches!(self, MediaError::TransportClosed)
    }
}

/// Live track yielding frames
#[async_trait]
pub trait TrackSource: Send {
    /// Next frame. May block indefinitely on a stalled track.
    async fn next_frame(&mut self) -> Result<Frame, MediaError>;
}

/// Optional per-frame analysis stage
pub trait Annotator: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, MediaError>;

    fn draw(&mut self, frame: &mut Frame, detections: &[Detection]) -> Result<(), MediaError>;
}

/// Downstream consumer of frames
pub trait FrameSink: Send {
    /// Hand over one frame. `SinkClosed` means the consumer asked to stop.
    fn deliver(&mut self, frame: Frame) -> Result<(), MediaError>;

    /// Release resources held by the sink
    fn close(&mut self) {}
}

/// Sink adapter over a closure
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: FnMut(Frame) -> Result<(), MediaError> + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> FrameSink for CallbackSink<F>
where
    F: FnMut(Frame) -> Result<(), MediaError> + Send,
{
    fn deliver(&mut self, frame: Frame) -> Result<(), MediaError> {
        (self.callback)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_track_end_is_teardown() {
        assert!(MediaError::TransportClosed.is_teardown());
        assert!(!MediaError::Timeout(Duration::from_secs(5)).is_teardown());
        assert!(!MediaError::CaptureFailure("decode".into()).is_teardown());
    }

    #[test]
    fn callback_sink_forwards() {
        let mut seen = Vec::new();
        {
            let mut sink = CallbackSink::new(|frame: Frame| {
                seen.push(frame.sequence);
                Ok(())
            });
            sink.deliver(Frame::new(3, Bytes::from_static(b"abc"), 90)).unwrap();
        }
        assert_eq!(seen, vec![3]);
    }

    #[test]
    fn frame_display() {
        let frame = Frame::new(7, Bytes::from_static(&[0, 0, 1]), 3000);
        assert_eq!(frame.to_string(), "frame #7 (3 bytes, ts=3000)");
    }
}
