pub mod config;
pub mod pipe;
pub mod s3;

pub use config::Config;
pub use pipe::{Destination, cat_out, pipe};
