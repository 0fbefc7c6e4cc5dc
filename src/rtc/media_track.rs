//! Media tracks
//!
//! Outgoing: one [`TrackLocalStaticSample`] shared by every session, fed
//! from an Annex-B H.264 byte stream on a blocking thread.
//! Incoming: [`RemoteTrackSource`] reassembles RTP packets into samples for
//! the frame ingestion pump.

use super::peer_connection::h264_capability;
use crate::media::{Frame, MediaError, TrackSource};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Reader buffer for the Annex-B parser
const READER_CAPACITY: usize = 1_048_576;

/// Packets a sample may lag before it is dropped
const MAX_LATE_PACKETS: u16 = 512;

/// Create the outgoing video track
pub fn new_outgoing_video_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        h264_capability(),
        "video".to_string(),
        "apelios-stream".to_string(),
    ))
}

/// Slice NAL units carry picture data; everything else rides along with them
fn is_picture(nal: &[u8]) -> bool {
    nal.first().map_or(false, |header| matches!(header & 0x1F, 1 | 5))
}

/// Feed `input` into `track` at `frame_duration` per picture until the input
/// ends or `running` is cleared. Resolves to the number of pictures written.
pub fn spawn_h264_feeder<R>(
    track: Arc<TrackLocalStaticSample>,
    input: R,
    frame_duration: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<Result<u64, MediaError>>
where
    R: Read + Send + 'static,
{
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut reader = H264Reader::new(input, READER_CAPACITY);
        let mut pictures = 0u64;
        let mut next_tick = Instant::now();

        while running.load(Ordering::Acquire) {
            let nal = match reader.next_nal() {
                Ok(nal) => nal,
                Err(e) => {
                    info!("H.264 input finished: {}", e);
                    break;
                }
            };

            let picture = is_picture(&nal.data);
            let sample = Sample {
                data: nal.data.freeze(),
                duration: if picture { frame_duration } else { Duration::ZERO },
                ..Default::default()
            };
            runtime
                .block_on(track.write_sample(&sample))
                .map_err(|e| MediaError::Sink(format!("write sample: {}", e)))?;

            if picture {
                pictures += 1;
                if pictures % 300 == 0 {
                    debug!("Sent {} pictures", pictures);
                }
                next_tick += frame_duration;
                let now = Instant::now();
                if next_tick > now {
                    std::thread::sleep(next_tick - now);
                } else {
                    next_tick = now;
                }
            }
        }
        Ok(pictures)
    })
}

/// Reassembles H.264 samples from a remote track
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
    builder: SampleBuilder<H264Packet>,
    sequence: u64,
}

impl RemoteTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        let clock_rate = track.codec().capability.clock_rate;
        Self {
            track,
            builder: SampleBuilder::new(MAX_LATE_PACKETS, H264Packet::default(), clock_rate),
            sequence: 0,
        }
    }
}

/// Read errors after the connection goes away all mention a closed pipe or EOF
fn map_read_error(e: impl std::fmt::Display) -> MediaError {
    let text = e.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("closed") || lower.contains("eof") {
        MediaError::TransportClosed
    } else {
        MediaError::CaptureFailure(text)
    }
}

#[async_trait]
impl TrackSource for RemoteTrackSource {
    async fn next_frame(&mut self) -> Result<Frame, MediaError> {
        loop {
            if let Some(sample) = self.builder.pop() {
                if sample.prev_dropped_packets > 0 {
                    warn!("{} packets dropped before frame", sample.prev_dropped_packets);
                }
                let frame = Frame::new(self.sequence, sample.data, sample.packet_timestamp);
                self.sequence += 1;
                return Ok(frame);
            }
            let (packet, _) = self.track.read_rtp().await.map_err(map_read_error)?;
            self.builder.push(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_nals_are_pictures() {
        assert!(is_picture(&[0x65, 0x88]));
        assert!(is_picture(&[0x41, 0x9a]));
        assert!(!is_picture(&[0x67, 0x42]));
        assert!(!is_picture(&[0x68]));
        assert!(!is_picture(&[]));
    }

    #[test]
    fn closed_reads_are_teardown() {
        assert!(map_read_error("io: read/write on closed pipe").is_teardown());
        assert!(map_read_error("EOF").is_teardown());
        assert!(!map_read_error("packet too short").is_teardown());
    }

    #[tokio::test]
    async fn feeder_counts_pictures() {
        let stream: Vec<u8> = [
            &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80][..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00][..],
            &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x00][..],
        ]
        .concat();
        let track = new_outgoing_video_track();
        let running = Arc::new(AtomicBool::new(true));

        let pictures = spawn_h264_feeder(
            track,
            std::io::Cursor::new(stream),
            Duration::from_millis(1),
            running,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(pictures, 2);
    }
}
