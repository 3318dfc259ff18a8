#![forbid(unsafe_code)]

pub mod codegen;
pub mod futures;
pub mod librt;
pub mod lift;
pub mod precedence;
pub mod sema;
pub mod storage;
pub mod symbols;
pub mod tasker;

pub use codegen::{CodeGen, reduce_kind};
pub use futures::FutureFlow;
pub use lift::Lifter;
pub use precedence::BinopPrecedence;
pub use sema::Analyzer;
pub use storage::{Ownership, Slot, StorageEntry, StorageTable, Teardown};
pub use symbols::{Context, FunctionDef, VariableDef};
pub use tasker::{
    Launch, LaunchArg, ReduceKind, ReductionTarget, ResourceKind, TaskArg, TaskInfo, TaskTable,
    TaskWrapper, Tasker,
};
