use std::collections::BTreeSet;

use contra_ast::{ContraError, Span};
use contra_core::{
    Launch, ReduceKind, ResourceKind, TaskArg, TaskInfo, TaskTable, TaskWrapper, Tasker,
};
use contra_ir::{BinOp, Builder, Type, ValueId};
use tracing::{debug, trace};

use crate::runtime::{self, *};

const RANGE_T: &str = "contra_kokkos_index_space_t";
const FIELD_T: &str = "contra_kokkos_field_t";
const PARTITION_T: &str = "contra_kokkos_partition_t";
const ACCESSOR_T: &str = "contra_kokkos_accessor_t";
const FUTURE_PREFIX: &str = "contra_kokkos_future_";

fn no_span() -> Span {
    contra_ast::span(0, 0)
}

fn future_name(value: &Type) -> String {
    let tag: String = value
        .display()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{FUTURE_PREFIX}{tag}")
}

fn pointee(b: &Builder, ptr: ValueId) -> Result<Type, ContraError> {
    match b.type_of(ptr)? {
        Type::Ptr(t) => Ok(*t),
        other => Err(ContraError::implementation(
            format!("expected a handle, found '{}'", other.display()),
            no_span(),
        )),
    }
}

/// A task function currently being emitted.
#[derive(Debug)]
struct Frame {
    span: Span,
    /// Slot holding the current point of an index task.
    index: Option<ValueId>,
}

/// Shared-memory backend: tasks are plain function calls, a parallel loop
/// is one `parallel_for`/`parallel_reduce` over an index space, and futures
/// are values that are always ready.
#[derive(Debug, Default)]
pub struct KokkosTasker {
    tasks: TaskTable,
    registered: BTreeSet<String>,
    top_level: Option<TaskInfo>,
    started: bool,
    frames: Vec<Frame>,
}

impl KokkosTasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.registered.contains(task)
    }

    fn span(&self) -> Span {
        self.frames.last().map(|f| f.span).unwrap_or_else(no_span)
    }

    fn rt(&self, b: &mut Builder, name: &str, args: Vec<ValueId>) -> Result<(), ContraError> {
        runtime::call(b, name, args, self.span())?;
        Ok(())
    }

    fn spill(&self, b: &mut Builder, name: &str, value: ValueId) -> Result<ValueId, ContraError> {
        let ty = b.type_of(value)?;
        let slot = b.alloca(name, ty)?;
        b.store(slot, value)?;
        Ok(slot)
    }

    /// The explicit index, or the current point of the enclosing index task.
    fn point(&self, b: &mut Builder, index: Option<ValueId>) -> Result<ValueId, ContraError> {
        if let Some(i) = index {
            return Ok(i);
        }
        match self.frames.last().and_then(|f| f.index) {
            Some(slot) => Ok(b.load(slot)?),
            None => Err(ContraError::implementation(
                "accessor used outside of a parallel loop",
                self.span(),
            )),
        }
    }

    fn register(&mut self) -> usize {
        let mut added = 0;
        for t in self.tasks.iter() {
            if self.registered.insert(t.name.clone()) {
                added += 1;
            }
        }
        added
    }

    fn range_fields(&self, b: &mut Builder, range: ValueId) -> Result<[ValueId; 3], ContraError> {
        let mut out = [range; 3];
        for (i, slot) in out.iter_mut().enumerate() {
            let ptr = b.field_ptr(range, i as u32)?;
            *slot = b.load(ptr)?;
        }
        Ok(out)
    }

    fn index_launch(&mut self, b: &mut Builder, launch: Launch, range: ValueId) -> Result<(), ContraError> {
        if launch.reductions.len() > 1 {
            return Err(ContraError::implementation(
                format!(
                    "loop '{}' reduces {} variables; the kokkos backend reduces at most one",
                    launch.task.name,
                    launch.reductions.len()
                ),
                launch.span,
            ));
        }
        let mut args = Vec::with_capacity(launch.args.len());
        let mut accessors = Vec::new();
        for (arg, param) in launch.args.iter().zip(&launch.task.args) {
            let stored = pointee(b, arg.value)?;
            match self.kind_of(&stored) {
                Some(ResourceKind::Field) => {
                    let ty = self.accessor_type(b)?;
                    let acc = b.alloca(&param.name, ty)?;
                    let part = match arg.partition {
                        Some(p) => p,
                        None => b.null(Type::Void)?,
                    };
                    self.rt(b, ACCESSOR_CREATE, vec![arg.value, part, acc])?;
                    args.push(acc);
                    accessors.push(acc);
                }
                Some(ResourceKind::Future) => {
                    let v = self.load_future(b, arg.value, &param.ty)?;
                    args.push(self.spill(b, &param.name, v)?);
                }
                // The kernel cuts each point's piece out of the partition.
                Some(ResourceKind::Range) => args.push(arg.partition.unwrap_or(arg.value)),
                Some(ResourceKind::Partition) | None => args.push(arg.value),
                Some(ResourceKind::Accessor) => {
                    return Err(ContraError::implementation(
                        format!("accessor '{}' cannot be handed to a parallel loop", param.name),
                        launch.span,
                    ));
                }
            }
        }

        let label = b.const_str(&launch.task.name)?;
        let kernel = b.function_ref(&launch.task.function)?;
        let argc = b.const_i64(args.len() as i64)?;
        match launch.reductions.first() {
            None => {
                let mut call = vec![label, kernel, range, argc];
                call.extend(args);
                self.rt(b, PARALLEL_FOR, call)?;
            }
            Some(r) => {
                let (code, combiner) = match &r.op {
                    ReduceKind::Add => (0, b.null(Type::Void)?),
                    ReduceKind::Mul => (1, b.null(Type::Void)?),
                    ReduceKind::Function(f) => (2, b.function_ref(f)?),
                };
                let code = b.const_i64(code)?;
                let mut call = vec![label, kernel, range, code, combiner, r.slot, argc];
                call.extend(args);
                self.rt(b, PARALLEL_REDUCE, call)?;
            }
        }
        debug!(task = %launch.task.name, accessors = accessors.len(), "parallel loop");
        for acc in accessors {
            self.destroy_accessor(b, acc)?;
        }
        Ok(())
    }
}

impl Tasker for KokkosTasker {
    fn name(&self) -> &'static str {
        "kokkos"
    }

    fn future_type(&mut self, b: &mut Builder, value: &Type) -> Result<Type, ContraError> {
        Ok(b.declare_struct(&future_name(value), vec![value.clone()])?)
    }

    fn range_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        // start, one past the end, step
        Ok(b.declare_struct(RANGE_T, vec![Type::I64, Type::I64, Type::I64])?)
    }

    fn field_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct(FIELD_T, vec![Type::void_ptr(), Type::I64])?)
    }

    fn partition_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct(PARTITION_T, vec![Type::void_ptr(), Type::I64])?)
    }

    fn accessor_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct(ACCESSOR_T, vec![Type::void_ptr(), Type::I64])?)
    }

    fn kind_of(&self, ty: &Type) -> Option<ResourceKind> {
        match ty.struct_name()? {
            RANGE_T => Some(ResourceKind::Range),
            FIELD_T => Some(ResourceKind::Field),
            PARTITION_T => Some(ResourceKind::Partition),
            ACCESSOR_T => Some(ResourceKind::Accessor),
            n if n.starts_with(FUTURE_PREFIX) => Some(ResourceKind::Future),
            _ => None,
        }
    }

    fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    fn is_started(&self) -> bool {
        self.started
    }

    // Kernels are plain functions; registration is bookkeeping only.
    fn preregister_tasks(&mut self, _b: &mut Builder) -> Result<(), ContraError> {
        let added = self.register();
        debug!(tasks = added, "register tasks");
        Ok(())
    }

    fn postregister_tasks(&mut self, _b: &mut Builder) -> Result<(), ContraError> {
        let added = self.register();
        trace!(tasks = added, "late task registration");
        Ok(())
    }

    fn set_top_level_task(&mut self, _b: &mut Builder, task: &TaskInfo) -> Result<(), ContraError> {
        self.top_level = Some(task.clone());
        Ok(())
    }

    fn start(&mut self, b: &mut Builder, args: &[String]) -> Result<(), ContraError> {
        let Some(top) = self.top_level.clone() else {
            return Err(ContraError::implementation(
                "runtime started without an entry task",
                self.span(),
            ));
        };
        if !top.args.is_empty() {
            return Err(ContraError::implementation(
                format!("entry task '{}' cannot take arguments", top.name),
                self.span(),
            ));
        }
        let mut call = vec![b.const_i64(args.len() as i64 + 1)?, b.const_str("contra")?];
        for a in args {
            call.push(b.const_str(a)?);
        }
        self.rt(b, RUNTIME_START, call)?;
        b.call(&top.function, Vec::new())?;
        self.started = true;
        debug!(entry = %top.name, "runtime started");
        Ok(())
    }

    fn stop(&mut self, b: &mut Builder) -> Result<(), ContraError> {
        self.rt(b, RUNTIME_STOP, Vec::new())
    }

    fn task_preamble(
        &mut self,
        b: &mut Builder,
        name: &str,
        span: Span,
        args: &[TaskArg],
        index: bool,
        results: &[Type],
    ) -> Result<TaskWrapper, ContraError> {
        if results.len() > 1 {
            return Err(ContraError::implementation(
                format!("task '{name}' returns {} values; the kokkos backend returns one", results.len()),
                span,
            ));
        }
        let ret = results.first().cloned().unwrap_or(Type::Void);

        if !index {
            let params = args.iter().map(|a| (a.name.clone(), a.ty.clone())).collect();
            let values = b.begin_function(name, span, params, ret);
            self.frames.push(Frame { span, index: None });
            let mut slots = Vec::with_capacity(args.len());
            for (a, v) in args.iter().zip(values) {
                slots.push(self.spill(b, &a.name, v)?);
            }
            return Ok(TaskWrapper {
                args: slots,
                index: None,
            });
        }

        // Kernel: the point, then a pointer to each captured value.
        let mut params = vec![("__index".to_string(), Type::I64)];
        params.extend(args.iter().map(|a| (a.name.clone(), Type::ptr(a.ty.clone()))));
        let values = b.begin_function(name, span, params, ret);
        let point = self.spill(b, "__index", values[0])?;
        self.frames.push(Frame {
            span,
            index: Some(point),
        });
        let mut slots = Vec::with_capacity(args.len());
        for (a, ptr) in args.iter().zip(&values[1..]) {
            let slot = if a.piece {
                let ty = self.range_type(b)?;
                let piece = b.alloca(&a.name, ty)?;
                let at = b.load(point)?;
                self.rt(b, PARTITION_PIECE, vec![*ptr, at, piece])?;
                piece
            } else {
                let v = b.load(*ptr)?;
                self.spill(b, &a.name, v)?
            };
            slots.push(slot);
        }
        trace!(task = name, args = slots.len(), "kernel preamble");
        Ok(TaskWrapper {
            args: slots,
            index: Some(point),
        })
    }

    fn task_postamble(&mut self, b: &mut Builder, results: &[ValueId]) -> Result<(), ContraError> {
        if !b.is_terminated() {
            b.ret(results.first().copied())?;
        }
        self.frames.pop();
        Ok(())
    }

    fn launch(&mut self, b: &mut Builder, launch: Launch) -> Result<Option<ValueId>, ContraError> {
        if launch.args.len() != launch.task.args.len() {
            return Err(ContraError::implementation(
                format!(
                    "task '{}' takes {} arguments, launched with {}",
                    launch.task.name,
                    launch.task.args.len(),
                    launch.args.len()
                ),
                launch.span,
            ));
        }
        if let Some(range) = launch.range {
            self.index_launch(b, launch, range)?;
            return Ok(None);
        }

        let mut values = Vec::with_capacity(launch.args.len());
        for (arg, param) in launch.args.iter().zip(&launch.task.args) {
            let stored = pointee(b, arg.value)?;
            let v = if self.is_future(&stored) {
                self.load_future(b, arg.value, &param.ty)?
            } else {
                b.load(arg.value)?
            };
            values.push(v);
        }
        let result = b.call(&launch.task.function, values)?;
        let (Some(v), Some(ty)) = (result, launch.task.result().cloned()) else {
            return Ok(None);
        };
        let future = self.create_future(b, "__future", &ty)?;
        self.to_future(b, v, future)?;
        Ok(Some(future))
    }

    fn create_future(&mut self, b: &mut Builder, name: &str, value: &Type) -> Result<ValueId, ContraError> {
        let ty = self.future_type(b, value)?;
        Ok(b.alloca(name, ty)?)
    }

    fn to_future(&mut self, b: &mut Builder, value: ValueId, future: ValueId) -> Result<(), ContraError> {
        let slot = b.field_ptr(future, 0)?;
        Ok(b.store(slot, value)?)
    }

    fn copy_future(&mut self, b: &mut Builder, src: ValueId, dst: ValueId) -> Result<(), ContraError> {
        Ok(b.memcopy(dst, src)?)
    }

    fn load_future(&mut self, b: &mut Builder, future: ValueId, value: &Type) -> Result<ValueId, ContraError> {
        let slot = b.field_ptr(future, 0)?;
        let v = b.load(slot)?;
        Ok(b.cast(v, value.clone())?)
    }

    fn destroy_future(&mut self, _b: &mut Builder, _future: ValueId) -> Result<(), ContraError> {
        Ok(())
    }

    fn create_range(
        &mut self,
        b: &mut Builder,
        name: &str,
        start: ValueId,
        end: ValueId,
        step: Option<ValueId>,
    ) -> Result<ValueId, ContraError> {
        let ty = self.range_type(b)?;
        let range = b.alloca(name, ty)?;
        let one = b.const_i64(1)?;
        let past_end = b.binary(BinOp::Add, end, one)?;
        let step = step.unwrap_or(one);
        for (i, v) in [start, past_end, step].into_iter().enumerate() {
            let slot = b.field_ptr(range, i as u32)?;
            b.store(slot, v)?;
        }
        Ok(range)
    }

    fn range_size(&mut self, b: &mut Builder, range: ValueId) -> Result<ValueId, ContraError> {
        let [start, end, step] = self.range_fields(b, range)?;
        // ceil((end - start) / step)
        let extent = b.binary(BinOp::Sub, end, start)?;
        let one = b.const_i64(1)?;
        let round = b.binary(BinOp::Sub, step, one)?;
        let padded = b.binary(BinOp::Add, extent, round)?;
        Ok(b.binary(BinOp::Div, padded, step)?)
    }

    fn load_range_value(&mut self, b: &mut Builder, range: ValueId, index: ValueId) -> Result<ValueId, ContraError> {
        let [start, _, step] = self.range_fields(b, range)?;
        let offset = b.binary(BinOp::Mul, index, step)?;
        Ok(b.binary(BinOp::Add, start, offset)?)
    }

    fn destroy_range(&mut self, _b: &mut Builder, _range: ValueId) -> Result<(), ContraError> {
        Ok(())
    }

    fn init_field(
        &mut self,
        b: &mut Builder,
        field: ValueId,
        name: &str,
        value: &Type,
        extent: ValueId,
        init: Option<ValueId>,
    ) -> Result<(), ContraError> {
        let label = b.const_str(name)?;
        let bytes = b.size_of(value.clone())?;
        let init = match init {
            Some(v) => {
                let v = b.cast(v, value.clone())?;
                self.spill(b, "__init", v)?
            }
            None => b.null(value.clone())?,
        };
        let create = if b.type_of(extent)? == Type::I64 {
            FIELD_CREATE
        } else {
            FIELD_CREATE_FROM_RANGE
        };
        self.rt(b, create, vec![label, bytes, init, extent, field])
    }

    fn destroy_field(&mut self, b: &mut Builder, field: ValueId) -> Result<(), ContraError> {
        self.rt(b, FIELD_DESTROY, vec![field])
    }

    fn partition(
        &mut self,
        b: &mut Builder,
        range: ValueId,
        colors: ValueId,
        by_count: bool,
    ) -> Result<ValueId, ContraError> {
        let ty = self.partition_type(b)?;
        let part = b.alloca("__part", ty)?;
        let create = if by_count {
            PARTITION_FROM_SIZE
        } else {
            PARTITION_FROM_ARRAY
        };
        self.rt(b, create, vec![colors, range, part])?;
        Ok(part)
    }

    fn destroy_partition(&mut self, b: &mut Builder, part: ValueId) -> Result<(), ContraError> {
        self.rt(b, PARTITION_DESTROY, vec![part])
    }

    fn load_accessor(
        &mut self,
        b: &mut Builder,
        accessor: ValueId,
        value: &Type,
        index: Option<ValueId>,
    ) -> Result<ValueId, ContraError> {
        let point = self.point(b, index)?;
        let out = b.alloca("__read", value.clone())?;
        self.rt(b, ACCESSOR_READ, vec![accessor, point, out])?;
        Ok(b.load(out)?)
    }

    fn store_accessor(
        &mut self,
        b: &mut Builder,
        accessor: ValueId,
        value: ValueId,
        index: Option<ValueId>,
    ) -> Result<(), ContraError> {
        let point = self.point(b, index)?;
        let input = self.spill(b, "__write", value)?;
        self.rt(b, ACCESSOR_WRITE, vec![accessor, point, input])
    }

    // A kernel works on a copy of the accessor the launch created and destroys.
    fn destroy_accessor(&mut self, b: &mut Builder, accessor: ValueId) -> Result<(), ContraError> {
        if self.frames.last().is_some_and(|f| f.index.is_some()) {
            return Ok(());
        }
        self.rt(b, ACCESSOR_DESTROY, vec![accessor])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_core::{LaunchArg, ReductionTarget};
    use contra_ir::validate_module;

    fn in_function(b: &mut Builder) {
        b.begin_function("main", no_span(), Vec::new(), Type::Void);
    }

    #[test]
    fn handle_types_are_classified() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        let range = k.range_type(&mut b).unwrap();
        let fut = k.future_type(&mut b, &Type::F64).unwrap();
        let acc = k.accessor_type(&mut b).unwrap();
        assert_eq!(k.kind_of(&range), Some(ResourceKind::Range));
        assert_eq!(k.kind_of(&fut), Some(ResourceKind::Future));
        assert_eq!(k.kind_of(&acc), Some(ResourceKind::Accessor));
        assert_eq!(k.kind_of(&Type::I64), None);
        assert_ne!(fut, k.future_type(&mut b, &Type::I64).unwrap());
    }

    #[test]
    fn futures_round_trip_through_their_value() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        in_function(&mut b);
        let f = k.create_future(&mut b, "f", &Type::I64).unwrap();
        let v = b.const_i64(3).unwrap();
        k.to_future(&mut b, v, f).unwrap();
        let out = k.load_future(&mut b, f, &Type::F64).unwrap();
        assert_eq!(b.type_of(out).unwrap(), Type::F64);
    }

    #[test]
    fn index_task_kernel_takes_the_point_then_pointers() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        let args = vec![TaskArg::new("x", Type::F64)];
        let w = k
            .task_preamble(&mut b, "t_loop0", no_span(), &args, true, &[Type::F64])
            .unwrap();
        assert!(w.index.is_some());
        let acc = b.load(w.args[0]).unwrap();
        k.task_postamble(&mut b, &[acc]).unwrap();
        b.finish_function().unwrap();

        let f = &b.module().functions["t_loop0"];
        assert_eq!(f.params[0].ty, Type::I64);
        assert_eq!(f.params[1].ty, Type::ptr(Type::F64));
        assert_eq!(f.ret, Type::F64);
        validate_module(b.module()).unwrap();
    }

    #[test]
    fn two_reductions_in_one_loop_are_rejected() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        in_function(&mut b);
        let task = k.tasks_mut().insert("t_loop0", "t_loop0", true, Vec::new(), vec![Type::I64; 2]);
        let (start, end) = (b.const_i64(0).unwrap(), b.const_i64(9).unwrap());
        let range = k.create_range(&mut b, "r", start, end, None).unwrap();
        let slot = b.alloca("s", Type::I64).unwrap();
        let target = |name: &str| ReductionTarget {
            name: name.into(),
            slot,
            op: ReduceKind::Add,
            ty: Type::I64,
        };
        let err = k
            .launch(
                &mut b,
                Launch {
                    task,
                    args: Vec::new(),
                    range: Some(range),
                    reductions: vec![target("a"), target("b")],
                    span: no_span(),
                },
            )
            .unwrap_err();
        assert!(err.message().contains("at most one"), "unexpected error: {err}");
    }

    #[test]
    fn field_arguments_become_accessors_for_the_loop() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        in_function(&mut b);
        let acc_ty = k.accessor_type(&mut b).unwrap();
        let task = k.tasks_mut().insert(
            "t_loop0",
            "t_loop0",
            true,
            vec![TaskArg::new("a", acc_ty)],
            Vec::new(),
        );
        let size = b.const_i64(8).unwrap();
        let field = k.create_field(&mut b, "a", &Type::F64, size, None).unwrap();
        let (start, end) = (b.const_i64(0).unwrap(), b.const_i64(7).unwrap());
        let range = k.create_range(&mut b, "r", start, end, None).unwrap();
        let out = k
            .launch(
                &mut b,
                Launch {
                    task,
                    args: vec![LaunchArg {
                        value: field,
                        partition: None,
                    }],
                    range: Some(range),
                    reductions: Vec::new(),
                    span: no_span(),
                },
            )
            .unwrap();
        assert!(out.is_none());
        b.ret(None).unwrap();
        b.finish_function().unwrap();
        let callees = b.module().functions["main"].callees();
        assert_eq!(
            callees,
            [FIELD_CREATE, ACCESSOR_CREATE, PARALLEL_FOR, ACCESSOR_DESTROY]
        );
    }

    #[test]
    fn partitioned_range_reaches_the_loop_as_its_partition() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        in_function(&mut b);
        let part_ty = k.partition_type(&mut b).unwrap();
        let task = k.tasks_mut().insert(
            "t_loop0",
            "t_loop0",
            true,
            vec![TaskArg::piece("r", part_ty)],
            Vec::new(),
        );
        let (start, end) = (b.const_i64(0).unwrap(), b.const_i64(9).unwrap());
        let range = k.create_range(&mut b, "r", start, end, None).unwrap();
        let colors = b.const_i64(2).unwrap();
        let part = k.partition(&mut b, range, colors, true).unwrap();
        k.launch(
            &mut b,
            Launch {
                task,
                args: vec![LaunchArg {
                    value: range,
                    partition: Some(part),
                }],
                range: Some(range),
                reductions: Vec::new(),
                span: no_span(),
            },
        )
        .unwrap();
        b.ret(None).unwrap();
        b.finish_function().unwrap();

        let main = &b.module().functions["main"];
        let handed: Vec<ValueId> = main
            .insts()
            .filter_map(|i| match &i.kind {
                contra_ir::InstKind::Call { callee, args } if callee == PARALLEL_FOR => {
                    Some(args[4..].to_vec())
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(handed, [part]);
    }

    #[test]
    fn kernel_cuts_its_piece_out_of_the_partition() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        let part = k.partition_type(&mut b).unwrap();
        let w = k
            .task_preamble(&mut b, "t_loop0", no_span(), &[TaskArg::piece("r", part.clone())], true, &[])
            .unwrap();
        assert!(k.is_range(&pointee(&b, w.args[0]).unwrap()));
        k.task_postamble(&mut b, &[]).unwrap();
        b.finish_function().unwrap();

        let f = &b.module().functions["t_loop0"];
        assert_eq!(f.params[1].ty, Type::ptr(part));
        assert_eq!(f.callees(), [PARTITION_PIECE]);
        validate_module(b.module()).unwrap();
    }

    #[test]
    fn kernel_leaves_the_accessor_to_its_launch() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        let acc = k.accessor_type(&mut b).unwrap();
        let w = k
            .task_preamble(&mut b, "t_loop0", no_span(), &[TaskArg::new("a", acc)], true, &[])
            .unwrap();
        k.destroy_accessor(&mut b, w.args[0]).unwrap();
        k.task_postamble(&mut b, &[]).unwrap();
        b.finish_function().unwrap();
        assert!(b.module().functions["t_loop0"].callees().is_empty());
    }

    #[test]
    fn start_calls_the_entry_task_directly() {
        let mut k = KokkosTasker::new();
        let mut b = Builder::new("m");
        b.begin_function("main_task", no_span(), Vec::new(), Type::Void);
        b.ret(None).unwrap();
        b.finish_function().unwrap();
        let task = k.tasks_mut().insert("main_task", "main_task", false, Vec::new(), Vec::new());

        in_function(&mut b);
        k.preregister_tasks(&mut b).unwrap();
        k.set_top_level_task(&mut b, &task).unwrap();
        k.start(&mut b, &["-t".to_string()]).unwrap();
        k.stop(&mut b).unwrap();
        b.ret(None).unwrap();
        b.finish_function().unwrap();

        assert!(k.is_started());
        assert!(k.is_registered("main_task"));
        let callees = b.module().functions["main"].callees();
        assert_eq!(callees, [RUNTIME_START, "main_task", RUNTIME_STOP]);
        validate_module(b.module()).unwrap();
    }
}
