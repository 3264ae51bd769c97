//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod files;
pub use files::*;
mod tracing_util;
pub use tracing_util::*;
