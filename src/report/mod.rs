//! Output for humans and for downstream consumers.
//!
//! - [`terminal`]: colored per-project tool tables and the failed-tool list; respects `--verbose` / `--quiet`.
//! - [`json`]: per-root findings documents written by `export`.

pub mod json;
pub mod terminal;
