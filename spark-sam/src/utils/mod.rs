pub mod image;
pub mod point;
pub mod tensor;

pub(crate) mod ptr_wrapper;
