//! Sweep orchestration on top of `axisweep-core` and `axisweep-comfyui`.
//!
//! Two runners share the same shape: validate the configuration and the
//! workflow, check the server, plan, then execute one submission at a
//! time while writing a metadata file per run.
//!
//! - [`sweep::AxisSweepRunner`] explores one prompt axis exhaustively and
//!   records it in the exploration state.
//! - [`image_batch::ImageBatchRunner`] drives an expression workflow over a
//!   directory of input images.

pub mod error;
pub mod image_batch;
pub mod progress;
pub mod record;
pub mod sweep;

pub use error::PipelineError;
