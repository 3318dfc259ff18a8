#![forbid(unsafe_code)]

mod config;
mod error;
mod session;

pub use config::{
    BackendKind, BackendOptions, CONFIG_FILE, CodegenOptions, CompileOptions, ConfigError,
    RuntimeOptions, find_config,
};
pub use error::CompileError;
pub use session::{Compiler, make_tasker};
