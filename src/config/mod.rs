pub mod manager;
pub mod types;
pub mod validation;

pub use manager::{ConfigEvent, ConfigFormat, ConfigManager};
pub use types::*;
pub use validation::{ConfigValidator, ValidationError};
