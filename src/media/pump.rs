//! Frame ingestion pump
//!
//! Drains one track with bounded latency. Every pull runs under a timeout;
//! timeouts and read errors draw on an [`ErrorBudget`] that a good frame
//! refills. The shared `running` flag is checked once per iteration so
//! cancellation only takes effect at a loop boundary.

use super::{Annotator, Detection, Frame, FrameSink, MediaError, TrackSource};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Frames between progress log lines
const PROGRESS_INTERVAL: u64 = 30;

/// Consecutive-failure budget
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    consecutive_failures: u32,
    pub threshold: u32,
    /// Time allowed for one frame
    pub timeout: Duration,
    /// Pause after a failure that did not exhaust the budget
    pub backoff: Duration,
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5), Duration::from_millis(500))
    }
}

impl ErrorBudget {
    pub fn new(threshold: u32, timeout: Duration, backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            threshold,
            timeout,
            backoff,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Count a failure. Returns true once the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.is_exhausted()
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }
}

/// Why the pump returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `running` was cleared by someone else
    Cancelled,
    BudgetExhausted,
    /// The source reported the track is gone
    TransportClosed,
    /// The display sink asked to stop
    SinkClosed,
}

/// Totals for one pump run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub frames: u64,
    pub failures: u64,
    /// Frames in which the annotator found something
    pub detections: u64,
    pub reason: StopReason,
}

type FrameCallback = Box<dyn FnMut(Frame) -> Result<(), MediaError> + Send>;

/// Per-track ingestion loop
pub struct FrameIngestionPump<S> {
    source: S,
    running: Arc<AtomicBool>,
    budget: ErrorBudget,
    annotator: Option<Box<dyn Annotator>>,
    callback: Option<FrameCallback>,
    display: Option<Box<dyn FrameSink>>,
    frames: u64,
    failures: u64,
    detections: u64,
}

impl<S: TrackSource> FrameIngestionPump<S> {
    pub fn new(source: S, running: Arc<AtomicBool>) -> Self {
        Self {
            source,
            running,
            budget: ErrorBudget::default(),
            annotator: None,
            callback: None,
            display: None,
            frames: 0,
            failures: 0,
            detections: 0,
        }
    }

    pub fn with_budget(mut self, budget: ErrorBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_annotator(mut self, annotator: Box<dyn Annotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// Frames go to `callback` instead of the display sink
    pub fn on_frame<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Frame) -> Result<(), MediaError> + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Pump-owned sink used when no callback is set; closed when the pump stops
    pub fn with_display(mut self, display: Box<dyn FrameSink>) -> Self {
        self.display = Some(display);
        self
    }

    /// Run until cancelled, the budget runs out or the track ends
    pub async fn run(mut self) -> PumpReport {
        info!("Starting frame ingestion");
        let reason = self.pump().await;

        if let Some(display) = self.display.as_mut() {
            display.close();
        }

        info!(
            "Stopped. Frames: {}, Failures: {}, Detections: {}",
            self.frames, self.failures, self.detections
        );
        PumpReport {
            frames: self.frames,
            failures: self.failures,
            detections: self.detections,
            reason,
        }
    }

    async fn pump(&mut self) -> StopReason {
        loop {
            if !self.running.load(Ordering::Acquire) {
                info!("Frame ingestion cancelled");
                return StopReason::Cancelled;
            }

            let pulled = tokio::time::timeout(self.budget.timeout, self.source.next_frame()).await;
            let result = pulled.unwrap_or(Err(MediaError::Timeout(self.budget.timeout)));

            let error = match result {
                Ok(frame) => {
                    self.budget.reset();
                    self.frames += 1;
                    if self.frames % PROGRESS_INTERVAL == 0 {
                        info!("Received {} frames ({})", self.frames, frame);
                    }
                    let frame = self.annotate(frame);
                    if let Err(reason) = self.deliver(frame) {
                        return reason;
                    }
                    continue;
                }
                Err(e) => e,
            };

            self.failures += 1;
            let exhausted = self.budget.record_failure();

            if error.is_teardown() {
                warn!("Track ended: {}", error);
                return StopReason::TransportClosed;
            }

            warn!(
                "{} ({}/{})",
                error,
                self.budget.consecutive_failures(),
                self.budget.threshold
            );
            if exhausted {
                error!("Too many consecutive failures, stopping");
                self.running.store(false, Ordering::Release);
                return StopReason::BudgetExhausted;
            }
            tokio::time::sleep(self.budget.backoff).await;
        }
    }

    /// Detection and drawing failures fall back to the unannotated frame
    fn annotate(&mut self, mut frame: Frame) -> Frame {
        let Some(annotator) = self.annotator.as_mut() else {
            return frame;
        };

        let detections: Vec<Detection> = annotator.detect(&frame).unwrap_or_else(|e| {
            error!("Detection error: {}", e);
            Vec::new()
        });
        if let Err(e) = annotator.draw(&mut frame, &detections) {
            error!("Drawing error: {}", e);
        }

        if !detections.is_empty() {
            if self.detections % PROGRESS_INTERVAL == 0 {
                info!("Frame {}: {} detection(s)", self.frames, detections.len());
            }
            self.detections += 1;
        }
        frame
    }

    fn deliver(&mut self, frame: Frame) -> Result<(), StopReason> {
        if let Some(callback) = self.callback.as_mut() {
            if let Err(e) = callback(frame) {
                error!("Frame callback error: {}", e);
            }
            return Ok(());
        }

        let Some(display) = self.display.as_mut() else {
            debug!("No sink, dropping {}", frame);
            return Ok(());
        };
        match display.deliver(frame) {
            Ok(()) => Ok(()),
            Err(MediaError::SinkClosed) => {
                info!("Display closed, stopping");
                self.running.store(false, Ordering::Release);
                Err(StopReason::SinkClosed)
            }
            Err(e) => {
                error!("Display error: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    enum Step {
        Stall,
        Frame,
        Fail,
    }

    /// Plays back a script, then reports the track as ended
    struct ScriptedSource {
        steps: VecDeque<Step>,
        sequence: u64,
    }

    impl ScriptedSource {
        fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                steps: steps.into_iter().collect(),
                sequence: 0,
            }
        }
    }

    #[async_trait]
    impl TrackSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Frame, MediaError> {
            match self.steps.pop_front() {
                Some(Step::Stall) => std::future::pending().await,
                Some(Step::Frame) => {
                    self.sequence += 1;
                    Ok(Frame::new(self.sequence, Bytes::from_static(b"\x00\x00\x01\x65"), 0))
                }
                Some(Step::Fail) => Err(MediaError::CaptureFailure("corrupt sample".into())),
                None => Err(MediaError::TransportClosed),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<u64>>>,
        closed: Arc<AtomicBool>,
        quit_after: Option<usize>,
    }

    impl FrameSink for RecordingSink {
        fn deliver(&mut self, frame: Frame) -> Result<(), MediaError> {
            let mut frames = self.frames.lock();
            frames.push(frame.sequence);
            if Some(frames.len()) == self.quit_after {
                return Err(MediaError::SinkClosed);
            }
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct BrokenAnnotator;

    impl Annotator for BrokenAnnotator {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, MediaError> {
            Err(MediaError::AnnotationFailure("model not loaded".into()))
        }

        fn draw(&mut self, _frame: &mut Frame, _detections: &[Detection]) -> Result<(), MediaError> {
            Err(MediaError::AnnotationFailure("no canvas".into()))
        }
    }

    struct EveryFrameAnnotator;

    impl Annotator for EveryFrameAnnotator {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, MediaError> {
            Ok(vec![Detection {
                label: "person".into(),
                confidence: 0.9,
                bbox: [0, 0, 10, 20],
            }])
        }

        fn draw(&mut self, _frame: &mut Frame, _detections: &[Detection]) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn budget_exhausts_at_threshold() {
        let mut budget = ErrorBudget::default();
        for _ in 0..9 {
            assert!(!budget.record_failure());
        }
        assert!(budget.record_failure());
        budget.reset();
        assert_eq!(budget.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ten_timeouts_stop_the_pump() {
        let running = running();
        let source = ScriptedSource::new((0..20).map(|_| Step::Stall));

        let report = FrameIngestionPump::new(source, running.clone()).run().await;

        assert_eq!(report.reason, StopReason::BudgetExhausted);
        assert_eq!(report.failures, 10);
        assert_eq!(report.frames, 0);
        assert!(!running.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_budget() {
        let running = running();
        let steps = (0..9)
            .map(|_| Step::Stall)
            .chain([Step::Frame])
            .chain((0..9).map(|_| Step::Fail))
            .chain([Step::Frame]);
        let sink = RecordingSink::default();
        let frames = sink.frames.clone();

        let report = FrameIngestionPump::new(ScriptedSource::new(steps), running.clone())
            .with_display(Box::new(sink))
            .run()
            .await;

        assert_eq!(report.reason, StopReason::TransportClosed);
        assert_eq!(report.frames, 2);
        assert_eq!(report.failures, 19);
        assert_eq!(*frames.lock(), vec![1, 2]);
        assert!(running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn annotation_failure_keeps_the_frame() {
        let sink = RecordingSink::default();
        let frames = sink.frames.clone();
        let source = ScriptedSource::new([Step::Frame, Step::Frame]);

        let report = FrameIngestionPump::new(source, running())
            .with_annotator(Box::new(BrokenAnnotator))
            .with_display(Box::new(sink))
            .run()
            .await;

        assert_eq!(report.frames, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(report.detections, 0);
        assert_eq!(*frames.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn callback_takes_precedence_over_display() {
        let sink = RecordingSink::default();
        let displayed = sink.frames.clone();
        let closed = sink.closed.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = seen.clone();

        let report = FrameIngestionPump::new(ScriptedSource::new([Step::Frame]), running())
            .with_annotator(Box::new(EveryFrameAnnotator))
            .with_display(Box::new(sink))
            .on_frame(move |frame| {
                seen_by_callback.lock().push(frame.sequence);
                Ok(())
            })
            .run()
            .await;

        assert_eq!(report.detections, 1);
        assert_eq!(*seen.lock(), vec![1]);
        assert!(displayed.lock().is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn display_quit_stops_the_pump() {
        let running = running();
        let sink = RecordingSink {
            quit_after: Some(2),
            ..Default::default()
        };
        let source = ScriptedSource::new((0..5).map(|_| Step::Frame));

        let report = FrameIngestionPump::new(source, running.clone())
            .with_display(Box::new(sink))
            .run()
            .await;

        assert_eq!(report.reason, StopReason::SinkClosed);
        assert_eq!(report.frames, 2);
        assert!(!running.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn cleared_flag_cancels_before_reading() {
        let running = Arc::new(AtomicBool::new(false));
        let sink = RecordingSink::default();
        let closed = sink.closed.clone();

        let report = FrameIngestionPump::new(ScriptedSource::new([Step::Frame]), running)
            .with_display(Box::new(sink))
            .run()
            .await;

        assert_eq!(report.reason, StopReason::Cancelled);
        assert_eq!(report.frames, 0);
        assert!(closed.load(Ordering::SeqCst));
    }
}
