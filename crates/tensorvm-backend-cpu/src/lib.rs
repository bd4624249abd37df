//! CPU kernel backend for the `tensorvm` runtime.
//!
//! Kernels are specialized for the widest vector width the host supports —
//! 16 f32 lanes on 512-bit hardware, 8 on 256-bit — over the lane-divisible
//! prefix of each buffer, with a scalar loop covering the remainder tail.
//! The width comes from a one-time process-wide probe. [`ScalarBackend`]
//! runs the same kernels pinned to the scalar tier and is the numeric
//! reference the vector paths are validated against.

mod capability;
mod dispatch;
mod elementwise;
mod matmul;
mod nn;

pub use capability::SimdLevel;
pub use dispatch::{ScalarBackend, SimdBackend};
