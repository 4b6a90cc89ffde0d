//! Core types shared by every layer: the error taxonomy, response codes and
//! their classification, resource paths, and protocol defaults.

mod code;
pub mod constants;
mod error;
mod path;

pub use code::*;
pub use constants::*;
pub use error::*;
pub use path::*;
