// THEORY:
// This file is the main entry point for the `vigil_vision` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (like the `vigil_runner` binary).
//
// The primary goal is to export the `SentinelPipeline` and its associated data
// structures (`PipelineConfig`, `FrameReport`, etc.) as the high-level interface
// for the whole surveillance engine. The individual stages live in `core_modules`
// and are public so that callers can substitute their own operators (a different
// background model, a real detection network, another clip encoder) behind the
// same traits the pipeline consumes.

pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use error::{VisionError, VisionResult};
