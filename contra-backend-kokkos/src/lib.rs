#![forbid(unsafe_code)]

mod runtime;
mod tasker;

pub use tasker::KokkosTasker;
