//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, startup graph check)
//!     → BulwarkConfig (validated, immutable)
//!     → converted into runtime settings for each subsystem
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → breaker settings, call timeouts and the admin key swapped in place
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Quotas and the startup graph are fixed for the life of the process

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BoundaryConfig, BreakerConfig, BreakerEntry, BulwarkConfig, ComponentConfig,
    ConnectionConfig, ObservabilityConfig, ServerConfig, StartupConfig,
};
pub use validation::{validate_config, ValidationError};
