//! Linear layers for SmoothQuant.
//!
//! This module provides:
//! - `W8A8Linear`: drop-in replacement for `nn::Linear` with fake-quantized
//!   weights and activations
//! - `Projection`: a named linear layer that is either float or W8A8
//! - `LinearObserver`: instrumentation seam used by calibration sweeps

mod projection;
mod w8a8;

pub use projection::{LinearObserver, NoopObserver, Projection};
pub use w8a8::W8A8Linear;
