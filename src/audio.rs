//! Audio encoding utilities.
//!
//! Generated samples are stored as 16-bit PCM WAV at whatever rate the
//! pipeline reports.

mod wav;

pub use wav::{encode_wav, to_pcm16};
