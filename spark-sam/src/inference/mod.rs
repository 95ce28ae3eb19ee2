//! The inference pipeline, one module per stage. Each stage that runs a
//! network builds its graph through [`crate::graph`].

pub mod image_encoder;
pub mod mask_decoder;
pub mod postprocess;
pub mod preprocess;
pub mod prompt_encoder;
