pub mod augment;
pub mod process_data;

pub use augment::{train_transforms, val_transforms, Compose, ImageTransform};
pub use process_data::{process_data, ProcessData};
