//! State cells with the actor pattern
//!
//! A cell owns one value and a loop that applies caller-supplied funs to it,
//! one at a time, in arrival order. Callers interact through four primitives:
//! - **get:** read, state unchanged
//! - **get_and_update:** read and replace
//! - **update:** replace
//! - **cast:** replace, fire-and-forget

mod core;
mod handle;
mod messages;
mod options;
mod registry;

pub use self::core::{CellStatus, Exit};
pub use handle::{CellId, StateCell};
pub use messages::{CellError, CellResult, StartError};
pub use options::{CellOptions, SpawnMode, SpawnOptions};
pub use registry::Registry;
