//! Testing utilities for camcore
//!
//! Synthetic frames and device descriptions used by the synthetic backend,
//! the test suite and the CLI demo mode.

pub mod synthetic_data;

pub use synthetic_data::{
    back_camera, formats_up_to, front_camera, microphone, synthetic_video_frame,
};
