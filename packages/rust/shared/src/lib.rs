//! Shared types, error model, and configuration for Postforge.
//!
//! This crate is the foundation depended on by all other Postforge crates.
//! It provides:
//! - [`PostforgeError`]: the unified error type
//! - Domain types ([`Post`], [`Channel`], [`CatalogItem`], [`ProductSnapshot`])
//! - Configuration ([`AppConfig`] and config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BrandConfig, DedupConfig, LlmConfig, ProductsConfig, RateLimitConfig,
    StorageConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_db_path, validate_api_key, validate_config,
};
pub use error::{PostforgeError, Result};
pub use types::{
    CatalogItem, Channel, ChannelFormat, FormatPriority, Post, PostId, PostStatus,
    ProductSnapshot,
};
