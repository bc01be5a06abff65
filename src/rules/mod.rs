//! On-disk knowledge base of agent rules, recipes and reference material.
//!
//! A preset is a directory of markdown section files plus a YAML cookbook.
//! The store loads presets into immutable [`RuleSet`] values and supports
//! atomic hot-reload: prompt builds hold an `Arc` snapshot, so a reload
//! never produces a torn view.

pub mod store;

pub use store::{CookbookRecipe, RuleSet, RuleStore};
