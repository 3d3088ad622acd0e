//! Sparse feature types and matching

pub mod base;
pub mod matcher;

pub use base::{Descriptors, FeatureError, FeatureExtractor, KeyPoint, Match, DESCRIPTOR_SIZE};
pub use matcher::HammingMatcher;
