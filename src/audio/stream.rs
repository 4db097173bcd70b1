//! Media stream handles shared between the peer backend and audio graphs.
//!
//! A [`MediaStream`] groups tracks plus the ring buffer carrying decoded PCM.
//! The producing side (a webrtc track reader or the external capture device)
//! keeps the [`StreamWriter`]; the audio graph takes the consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Single audio track
#[derive(Debug)]
pub struct MediaTrack {
    id: u64,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    fn new() -> Self {
        Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A disabled track produces silence
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track permanently; producers watch this flag and exit.
    /// Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }
}

/// Audio stream of one or more tracks backed by a PCM ring buffer
pub struct MediaStream {
    tracks: Vec<Arc<MediaTrack>>,
    source: Mutex<Option<HeapCons<f32>>>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("tracks", &self.tracks)
            .field("source_taken", &self.source.lock().is_none())
            .finish()
    }
}

impl MediaStream {
    /// Create a single-track stream and the writer feeding it.
    ///
    /// # Arguments
    /// * `capacity` - Ring buffer size in samples
    pub fn new(capacity: usize) -> (Arc<MediaStream>, StreamWriter) {
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let track = Arc::new(MediaTrack::new());
        let stream = Arc::new(MediaStream {
            tracks: vec![track.clone()],
            source: Mutex::new(Some(consumer)),
        });
        let writer = StreamWriter { producer, track };
        (stream, writer)
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// First audio track of the stream
    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.first()
    }

    /// Take the PCM consumer; only the first caller gets it
    pub fn take_source(&self) -> Option<HeapCons<f32>> {
        self.source.lock().take()
    }

    /// Stop every track. Returns the number of tracks that were still live.
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Producing end of a [`MediaStream`]
pub struct StreamWriter {
    producer: HeapProd<f32>,
    track: Arc<MediaTrack>,
}

impl StreamWriter {
    /// Push samples; a disabled track writes silence instead.
    /// Returns the number of samples accepted, 0 once the track is stopped.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        if self.track.is_stopped() {
            return 0;
        }
        if self.track.is_enabled() {
            self.producer.push_slice(samples)
        } else {
            let mut written = 0;
            for _ in 0..samples.len() {
                if self.producer.try_push(0.0).is_err() {
                    break;
                }
                written += 1;
            }
            written
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.track.is_stopped()
    }

    pub fn track(&self) -> &Arc<MediaTrack> {
        &self.track
    }
}

/// Pull up to `out.len()` samples, padding with silence on underrun.
/// Returns the number of real samples read.
pub fn read_or_silence(source: &mut HeapCons<f32>, out: &mut [f32]) -> usize {
    let n = source.pop_slice(out);
    out[n..].iter_mut().for_each(|s| *s = 0.0);
    n
}

/// Samples waiting in a source
pub fn available(source: &HeapCons<f32>) -> usize {
    source.occupied_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_feeds_source() {
        let (stream, mut writer) = MediaStream::new(16);
        let mut source = stream.take_source().unwrap();
        assert!(stream.take_source().is_none());

        assert_eq!(writer.write(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(available(&source), 3);

        let mut out = [1.0f32; 5];
        assert_eq!(read_or_silence(&mut source, &mut out), 3);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.0, 0.0]);
    }

    #[test]
    fn test_disabled_track_writes_silence() {
        let (stream, mut writer) = MediaStream::new(16);
        let mut source = stream.take_source().unwrap();
        stream.audio_track().unwrap().set_enabled(false);
        writer.write(&[0.5, 0.5]);
        let mut out = [1.0f32; 2];
        read_or_silence(&mut source, &mut out);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (stream, mut writer) = MediaStream::new(16);
        assert_eq!(stream.stop(), 1);
        assert_eq!(stream.stop(), 0);
        assert!(stream.is_stopped());
        assert!(writer.is_stopped());
        assert_eq!(writer.write(&[1.0]), 0);
    }
}
