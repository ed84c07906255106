//! Pipeline configuration
//!
//! - `schema`: serde types with session defaults
//! - `loader`: JSON file read/write

pub mod loader;
pub mod schema;

pub use loader::{load_config, save_config};
pub use schema::{
    BindingConfig, CaptureConfig, ConsumerSettings, EncoderConfig, PipelineConfig, SwitchPlan,
};
