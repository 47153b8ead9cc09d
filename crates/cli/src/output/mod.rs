//! Structured output envelope.

mod format;
mod model;
mod result_builder;

pub use format::OutputFormat;
pub use model::{CommandError, CommandResult, ErrorCode};
pub use result_builder::{ResultBuilder, print_result};
