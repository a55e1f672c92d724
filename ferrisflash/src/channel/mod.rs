//! Channel layer for prompt matching on interactive shells.
//!
//! Device output is accumulated in a [`PatternBuffer`] with ANSI escapes
//! stripped, and searched for prompt or marker patterns.

mod buffer;
mod patterns;

pub use buffer::PatternBuffer;
pub use patterns::{MarkerSet, compile_prompt_pattern};
