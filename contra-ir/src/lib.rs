#![forbid(unsafe_code)]

pub mod builder;
pub mod display;
pub mod error;
pub mod ir;
pub mod validate;

pub use builder::*;
pub use display::*;
pub use error::*;
pub use ir::*;
pub use validate::*;
