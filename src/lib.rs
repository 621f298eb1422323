//! Public interface to the Rangemaster core library, linked by the master
//! daemon executable and the admin CLI tool.

#[macro_use]
pub mod utils;

pub mod api;
pub mod catalog;
pub mod coord;
pub mod dfs;
pub mod master;

pub use utils::{logger_init, RangemasterError};
