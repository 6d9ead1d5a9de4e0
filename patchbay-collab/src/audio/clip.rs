//! Fixed binary layout for audio clip payloads.
//!
//! Wire layout, all little-endian:
//! ```text
//! ┌──────────────┬───────────────┬─────────────────────┬─────────────────────────┐
//! │ sample rate  │ channel count │ samples per channel │ channel 0 samples, then │
//! │ f32          │ u32           │ u32                 │ channel 1 samples, …    │
//! └──────────────┴───────────────┴─────────────────────┴─────────────────────────┘
//! ```
//! Samples are raw 32-bit floats, one full channel at a time (planar, not
//! interleaved).

const HEADER_LEN: usize = 12;

/// Channel counts and lengths beyond these are corrupt input, not audio.
const MAX_CHANNELS: u32 = 32;
const MAX_SAMPLES_PER_CHANNEL: u32 = 48_000 * 60 * 10;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub sample_rate: f32,
    /// One sample buffer per channel; all channels have equal length.
    pub channels: Vec<Vec<f32>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClipError {
    Truncated,
    BadHeader(String),
    UnevenChannels,
}

impl std::fmt::Display for ClipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Clip payload shorter than its header claims"),
            Self::BadHeader(msg) => write!(f, "Bad clip header: {msg}"),
            Self::UnevenChannels => write!(f, "Channels have differing sample counts"),
        }
    }
}

impl std::error::Error for ClipError {}

impl AudioClip {
    pub fn new(sample_rate: f32, channels: Vec<Vec<f32>>) -> Result<Self, ClipError> {
        if let Some(first) = channels.first() {
            if channels.iter().any(|c| c.len() != first.len()) {
                return Err(ClipError::UnevenChannels);
            }
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate > 0.0 {
            self.samples_per_channel() as f32 / self.sample_rate
        } else {
            0.0
        }
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let samples = self.samples_per_channel();
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.channels.len() * samples * 4);
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
        out.extend_from_slice(&(samples as u32).to_le_bytes());
        for channel in &self.channels {
            for sample in channel {
                out.extend_from_slice(&sample.to_le_bytes());
            }
        }
        out
    }

    /// Parse the fixed wire layout, validating length against the header.
    pub fn decode(bytes: &[u8]) -> Result<Self, ClipError> {
        if bytes.len() < HEADER_LEN {
            return Err(ClipError::Truncated);
        }
        let sample_rate = f32::from_le_bytes(read4(bytes, 0));
        let channel_count = u32::from_le_bytes(read4(bytes, 4));
        let samples = u32::from_le_bytes(read4(bytes, 8));

        if !sample_rate.is_finite() || sample_rate < 0.0 {
            return Err(ClipError::BadHeader(format!(
                "sample rate {sample_rate} out of range"
            )));
        }
        if channel_count > MAX_CHANNELS {
            return Err(ClipError::BadHeader(format!(
                "channel count {channel_count} out of range"
            )));
        }
        if samples > MAX_SAMPLES_PER_CHANNEL {
            return Err(ClipError::BadHeader(format!(
                "sample length {samples} out of range"
            )));
        }
        let expected = HEADER_LEN + channel_count as usize * samples as usize * 4;
        if bytes.len() != expected {
            return Err(ClipError::Truncated);
        }

        let mut channels = Vec::with_capacity(channel_count as usize);
        let mut offset = HEADER_LEN;
        for _ in 0..channel_count {
            let mut channel = Vec::with_capacity(samples as usize);
            for _ in 0..samples {
                channel.push(f32::from_le_bytes(read4(bytes, offset)));
                offset += 4;
            }
            channels.push(channel);
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }
}

fn read4(bytes: &[u8], offset: usize) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    buf
}
