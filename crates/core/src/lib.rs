// Core types and functionality for the Gantz tool relay

pub mod types;
pub mod template;
pub mod manifest;
pub mod registry;
pub mod validation;
pub mod redact;
pub mod secrets;
pub mod sandbox;
pub mod rate_limit;
pub mod auth;
pub mod audit;

pub use types::*;
pub use manifest::{load, load_str, LoadError, ManifestFormat};
pub use registry::{ManifestInfo, ToolRegistry, ToolSchema};
