mod session;
mod state;

pub use session::{MaskOutput, SamImageInference, SamSession};
pub use state::{ImageEmbedding, InferenceState};
