//! Point-prompted image segmentation with the Segment Anything model, running
//! on the CPU through a planned tensor graph.
//!
//! ```no_run
//! use spark_sam::{ImageU8, Point, SamImageInference, SamSession};
//!
//! # fn main() -> spark_sam::Result<()> {
//! let session = SamSession::load("sam_vit_b.bin", 8)?;
//! let image = ImageU8::filled(640, 480, [40, 40, 40]);
//! session.encode_image(&image)?;
//! let output = session.compute_masks(Point::new(320.0, 240.0))?;
//! if let Some(best) = output.best() {
//!     println!("iou {:.3}, {} pixels", best.iou_score, best.area());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod inference;
pub mod model;
pub mod utils;

pub use config::SessionConfig;
pub use engine::{ImageEmbedding, InferenceState, MaskOutput, SamImageInference, SamSession};
pub use error::{LoadError, PreprocessError, Result, SamError};
pub use inference::postprocess::MaskResult;
pub use model::hparams::{is_global_attention_layer, Hyperparameters};
pub use model::SamModel;
pub use utils::image::{ImageF32, ImageU8};
pub use utils::point::Point;
