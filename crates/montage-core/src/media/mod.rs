//! Media access: decoded PCM, the provider contract and the decode cache
//!
//! The engine never decodes compressed media itself; it asks a
//! [`MediaProvider`] for PCM keyed by a stable source identity. A single
//! provider instance is the long-lived decode context; the
//! [`DecodedBufferCache`] in front of it guarantees one decode per source
//! for the lifetime of a play session.

pub mod wav;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::types::{Sample, StereoBuffer, StereoSample};

/// Errors raised while fetching or decoding media
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Source identity is not registered with the provider
    #[error("unknown media source: {0}")]
    UnknownSource(String),

    /// File could not be opened or read
    #[error("io error: {0}")]
    Io(String),

    /// Bytes are not a format the provider understands
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Sample layout the decoder does not support
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),
}

/// Decoded PCM audio
///
/// Planar channel layout at a native sample rate. Shared as `Arc` between
/// the scheduler, the sidechain engine and the offline mixdown; never
/// mutated after decode.
#[derive(Debug, Clone)]
pub struct AudioData {
    pub channels: Vec<Vec<Sample>>,
    pub sample_rate: u32,
}

impl AudioData {
    /// Mono data from a single channel.
    pub fn from_mono(samples: Vec<Sample>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Number of sample frames.
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Duration in seconds at the native rate.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Mix every channel down to mono.
    pub fn to_mono(&self) -> Vec<Sample> {
        crate::dsp::mono_mix(&self.channels)
    }

    /// Stereo frame at `index`; mono sources are duplicated to both sides.
    #[inline]
    pub fn stereo_frame(&self, index: usize) -> StereoSample {
        match self.channels.len() {
            0 => StereoSample::silence(),
            1 => StereoSample::mono(self.channels[0].get(index).copied().unwrap_or(0.0)),
            _ => StereoSample::new(
                self.channels[0].get(index).copied().unwrap_or(0.0),
                self.channels[1].get(index).copied().unwrap_or(0.0),
            ),
        }
    }

    /// Copy a frame range into a stereo buffer.
    pub fn stereo_slice(&self, start: usize, len: usize) -> StereoBuffer {
        let mut out = StereoBuffer::silence(len);
        for i in 0..len {
            out[i] = self.stereo_frame(start + i);
        }
        out
    }
}

/// Stable identity of a decodable source
///
/// Timeline clips reference library assets by id; one-shot definitions may
/// instead point at a remote library sound by URL. Same key, same PCM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    /// A media asset in the project library
    Asset(Uuid),
    /// A one-shot library sound addressed by URL
    Url(String),
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKey::Asset(id) => write!(f, "asset:{}", id),
            SourceKey::Url(url) => write!(f, "url:{}", url),
        }
    }
}

/// Provider of decoded PCM for the engine
///
/// Contract: the same key always resolves to the same audio; decode is
/// allowed to be slow (it runs off the audio thread); implementations are
/// the single long-lived decoder context of the engine.
pub trait MediaProvider: Send + Sync {
    fn decode(&self, key: &SourceKey) -> Result<Arc<AudioData>, MediaError>;
}

/// File-backed provider reading WAV blobs from registered paths
///
/// The editor registers a durable file handle (a path) per asset id or
/// library URL; decode goes through the WAV reader.
#[derive(Default)]
pub struct FileMediaProvider {
    paths: Mutex<HashMap<SourceKey, PathBuf>>,
}

impl FileMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the blob handle for a source. Re-registering replaces it.
    pub fn register(&self, key: SourceKey, path: impl AsRef<Path>) {
        self.paths
            .lock()
            .unwrap()
            .insert(key, path.as_ref().to_path_buf());
    }

    pub fn unregister(&self, key: &SourceKey) {
        self.paths.lock().unwrap().remove(key);
    }
}

impl MediaProvider for FileMediaProvider {
    fn decode(&self, key: &SourceKey) -> Result<Arc<AudioData>, MediaError> {
        let path = self
            .paths
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| MediaError::UnknownSource(key.to_string()))?;
        wav::read_wav(&path).map(Arc::new)
    }
}

/// In-memory provider for tests and headless tooling
#[derive(Default)]
pub struct MemoryMediaProvider {
    sources: Mutex<HashMap<SourceKey, Arc<AudioData>>>,
}

impl MemoryMediaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SourceKey, data: AudioData) {
        self.sources.lock().unwrap().insert(key, Arc::new(data));
    }
}

impl MediaProvider for MemoryMediaProvider {
    fn decode(&self, key: &SourceKey) -> Result<Arc<AudioData>, MediaError> {
        self.sources
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| MediaError::UnknownSource(key.to_string()))
    }
}

/// Keyed cache of decoded buffers
///
/// One decode per source key. Entries survive play sessions and are only
/// evicted on scene content changes or explicit removal, so file handles
/// and decode work are not repeated while the user scrubs.
pub struct DecodedBufferCache {
    provider: Arc<dyn MediaProvider>,
    buffers: Mutex<HashMap<SourceKey, Arc<AudioData>>>,
}

impl DecodedBufferCache {
    pub fn new(provider: Arc<dyn MediaProvider>) -> Self {
        Self {
            provider,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch from cache or decode through the provider.
    ///
    /// Decode failures are logged and yield `None`; the source simply drops
    /// out of the mix.
    pub fn get_or_decode(&self, key: &SourceKey) -> Option<Arc<AudioData>> {
        if let Some(hit) = self.buffers.lock().unwrap().get(key) {
            return Some(hit.clone());
        }
        match self.provider.decode(key) {
            Ok(data) => {
                self.buffers.lock().unwrap().insert(key.clone(), data.clone());
                Some(data)
            }
            Err(err) => {
                log::warn!("decode failed for {}: {}", key, err);
                None
            }
        }
    }

    /// Drop a single cached buffer.
    pub fn evict(&self, key: &SourceKey) {
        self.buffers.lock().unwrap().remove(key);
    }

    /// Drop every cached buffer.
    pub fn clear(&self) {
        self.buffers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize) -> AudioData {
        AudioData::from_mono(vec![0.5; frames], 44_100)
    }

    #[test]
    fn test_audio_data_dimensions() {
        let data = tone(22_050);
        assert_eq!(data.frames(), 22_050);
        assert!((data.duration_seconds() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stereo_frame_duplicates_mono() {
        let data = tone(4);
        let frame = data.stereo_frame(0);
        assert_eq!(frame.left, 0.5);
        assert_eq!(frame.right, 0.5);
        // Out of range reads are silent, not a panic.
        assert_eq!(data.stereo_frame(100), StereoSample::silence());
    }

    #[test]
    fn test_memory_provider_roundtrip() {
        let provider = MemoryMediaProvider::new();
        let key = SourceKey::Url("lib://kick".into());
        provider.insert(key.clone(), tone(10));

        let decoded = provider.decode(&key).unwrap();
        assert_eq!(decoded.frames(), 10);
        assert!(provider.decode(&SourceKey::Url("lib://missing".into())).is_err());
    }

    #[test]
    fn test_cache_decodes_once_and_evicts() {
        let provider = Arc::new(MemoryMediaProvider::new());
        let key = SourceKey::Asset(Uuid::new_v4());
        provider.insert(key.clone(), tone(8));

        let cache = DecodedBufferCache::new(provider.clone());
        let a = cache.get_or_decode(&key).unwrap();
        let b = cache.get_or_decode(&key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        cache.evict(&key);
        assert!(cache.get_or_decode(&key).is_some());

        // Unknown key: None, no panic.
        assert!(cache.get_or_decode(&SourceKey::Url("nope".into())).is_none());
    }
}
