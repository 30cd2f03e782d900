//! Core generation pipeline and domain logic for Postforge.
//!
//! This crate ties the weekday calendar, topic and strategy stages, dedup
//! checks, product selection and content rendering into one sequential
//! pipeline exposed by [`PostService`].

pub mod content_engine;
pub mod dedupe;
pub mod json_repair;
pub mod pipeline;
pub mod products;
pub mod rate_limit;
pub mod strategy;
pub mod theme;
pub mod topic;
pub mod topic_engine;

#[cfg(test)]
mod test_support;

pub use dedupe::{BatchUsage, DedupContext, DedupVerdict};
pub use pipeline::{GenerateOutcome, GenerateRequest, LOCAL_CALLER, PostService};
pub use theme::{ThemeDescriptor, resolve_theme, second_post_theme};
