pub mod archive;
pub mod config;
pub mod crypto;
pub mod error;
pub mod huffman;
pub mod types;

pub use archive::Archive;
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
