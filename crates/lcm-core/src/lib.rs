pub mod content;
pub mod error;
pub mod ids;
pub mod tokens;
pub mod types;

pub use content::{PartBody, PartType};
pub use error::LcmError;
pub use tokens::estimate_tokens;
pub use types::*;
