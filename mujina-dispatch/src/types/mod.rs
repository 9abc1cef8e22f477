//! Core types shared across the dispatch engine.

pub mod difficulty;

pub use difficulty::{
    difficulty_to_target, share_difficulty, target_to_difficulty, Difficulty, TRUEDIFFONE,
};
