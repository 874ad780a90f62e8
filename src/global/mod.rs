//! Program-wide directories and settings.

pub mod settings;
pub mod utils;
