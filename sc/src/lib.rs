//! StateCell - serialized single-owner state over message passing
//!
//! A [`StateCell`] owns a value of any `Send` type. Concurrent callers never
//! touch the value directly: they send funs to the cell, which runs them one
//! at a time in the order received.
//!
//! # Example
//!
//! ```ignore
//! use statecell::{CellOptions, StateCell};
//!
//! let cell = StateCell::start(|| 0u64, CellOptions::new().name("hits")).await?;
//! cell.update(|n| n + 1).await?;
//! cell.cast(|n| n + 1);
//! assert_eq!(cell.get(|n| *n).await?, 2);
//! cell.stop().await?;
//! ```
//!
//! # Modules
//!
//! - [`cell`] - the cell handle, its loop, and the name registry
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface for the `sc` binary

pub mod cell;
pub mod cli;
pub mod config;

pub use cell::{
    CellError, CellId, CellOptions, CellResult, CellStatus, Exit, Registry, SpawnMode, SpawnOptions, StartError,
    StateCell,
};
pub use config::Config;

/// Default timeout for synchronous calls (5s)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;
