//! Waveform records and the amplitude blob codec.
//!
//! Blob layout, repeated once per channel, all integers little-endian:
//!
//! ```text
//! u16 name_len | name (utf-8) | u32 sample_count | sample_count x f32
//! ```
//!
//! Samples are stored as `f32`; that is the store's declared precision.

use super::StoreError;
use crate::instrument::PulseParameters;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channel name to amplitude samples.
pub type Waveform = BTreeMap<String, Vec<f32>>;

/// One persisted pulse. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRecord {
    /// Row key: wall-clock UNIX seconds
    pub timestamp: f64,
    /// Amplitudes per channel
    pub waveform: Waveform,
    /// Acquisition parameters, `None` for records imported without them
    pub params: Option<PulseParameters>,
    /// Free-form context (run id, jig, settings)
    pub metadata: serde_json::Value,
}

impl WaveformRecord {
    /// Record awaiting its row key, with no metadata.
    pub fn new(waveform: Waveform, params: Option<PulseParameters>) -> Self {
        Self {
            timestamp: 0.0,
            waveform,
            params,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach free-form context.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Serialize all channels of a waveform into one blob.
pub fn encode_amplitudes(waveform: &Waveform) -> Result<Vec<u8>, StoreError> {
    let capacity = waveform
        .iter()
        .map(|(name, samples)| 2 + name.len() + 4 + samples.len() * 4)
        .sum();
    let mut buf = Vec::with_capacity(capacity);

    for (name, samples) in waveform {
        let name_len = u16::try_from(name.len())
            .map_err(|_| StoreError::Encoding(format!("channel name too long: {}", name.len())))?;
        let count = u32::try_from(samples.len())
            .map_err(|_| StoreError::Encoding(format!("too many samples in '{}'", name)))?;

        buf.put_u16_le(name_len);
        buf.put_slice(name.as_bytes());
        buf.put_u32_le(count);
        for sample in samples {
            buf.put_f32_le(*sample);
        }
    }
    Ok(buf)
}

/// Inverse of [`encode_amplitudes`].
pub fn decode_amplitudes(mut blob: &[u8]) -> Result<Waveform, StoreError> {
    let mut waveform = Waveform::new();

    while blob.has_remaining() {
        if blob.remaining() < 2 {
            return Err(StoreError::Encoding("truncated channel header".to_string()));
        }
        let name_len = blob.get_u16_le() as usize;
        if blob.remaining() < name_len + 4 {
            return Err(StoreError::Encoding("truncated channel name".to_string()));
        }
        let name = String::from_utf8(blob[..name_len].to_vec())
            .map_err(|e| StoreError::Encoding(format!("channel name is not utf-8: {}", e)))?;
        blob.advance(name_len);

        let count = blob.get_u32_le() as usize;
        if blob.remaining() < count * 4 {
            return Err(StoreError::Encoding(format!(
                "channel '{}' declares {} samples but blob is short",
                name, count
            )));
        }
        let samples = (0..count).map(|_| blob.get_f32_le()).collect();
        waveform.insert(name, samples);
    }
    Ok(waveform)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_channel_blob_round_trip() {
        let mut waveform = Waveform::new();
        waveform.insert("amps/0".to_string(), vec![0.0, 0.125, -3.5]);
        waveform.insert("amps/1".to_string(), vec![]);
        waveform.insert("trigger".to_string(), vec![1.0]);

        let blob = encode_amplitudes(&waveform).unwrap();
        let decoded = decode_amplitudes(&blob).unwrap();
        assert_eq!(decoded, waveform);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let mut waveform = Waveform::new();
        waveform.insert("amps".to_string(), vec![1.0, 2.0]);
        let blob = encode_amplitudes(&waveform).unwrap();

        let result = decode_amplitudes(&blob[..blob.len() - 1]);
        assert!(matches!(result, Err(StoreError::Encoding(_))));
    }
}
