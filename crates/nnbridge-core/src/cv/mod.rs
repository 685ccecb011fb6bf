//! Image preprocessing and the matrices that drive it.

mod image;
mod matrix;

pub use image::{create_image_tensor, Filter, ImageFormat, ImageProcess, ImageProcessConfig, Wrap};
pub use matrix::Matrix;
