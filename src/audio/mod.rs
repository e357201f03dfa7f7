//! # Audio Module
//!
//! Everything that touches sample data. The functions here are pure and
//! synchronous; none of them perform I/O or hold state across calls, so the
//! relay can run them inline for any number of concurrent calls.
//!
//! ## Key Components:
//! - **Frame**: `AudioFrame`, a byte buffer tagged with encoding and rate
//! - **Codec**: G.711 µ-law expansion and compression
//! - **Resample**: linear-interpolation rate conversion for PCM16
//! - **Pipeline**: the fixed ingress/egress compositions plus chunking
//! - **Buffer**: bounded drop-oldest queue feeding the telephony socket
//!
//! ## Audio Format Requirements:
//! - **Telephony**: 8 kHz µ-law, mono
//! - **Endpoint input**: 16 kHz, 16-bit PCM, mono, little-endian
//! - **Endpoint output**: 24 kHz, 16-bit PCM, mono, little-endian

pub mod buffer;   // Bounded egress frame queue
pub mod codec;    // µ-law <-> linear PCM16
pub mod frame;    // Typed audio frames
pub mod pipeline; // Ingress/egress compositions
pub mod resample; // Sample rate conversion

pub use frame::{AudioFrame, Encoding};
