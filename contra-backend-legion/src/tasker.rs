use std::collections::BTreeSet;

use contra_ast::{ContraError, Span};
use contra_core::{
    Launch, LaunchArg, ReduceKind, ResourceKind, TaskArg, TaskInfo, TaskTable, TaskWrapper, Tasker,
};
use contra_ir::{Builder, Type, ValueId};
use tracing::{debug, trace};

use crate::runtime::{self, *};

const FUTURE_T: &str = "contra_legion_future_t";
const INDEX_SPACE_T: &str = "contra_legion_index_space_t";
const FIELD_T: &str = "contra_legion_field_t";
const PARTITION_T: &str = "contra_legion_partition_t";
const ACCESSOR_T: &str = "contra_legion_accessor_t";
const LAUNCHER_T: &str = "contra_legion_task_launcher_t";
const FUTURE_MAP_T: &str = "contra_legion_future_map_t";

fn no_span() -> Span {
    contra_ast::span(0, 0)
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

fn opaque(b: &mut Builder, name: &str) -> Result<Type, ContraError> {
    Ok(b.declare_struct(name, vec![Type::void_ptr()])?)
}

fn reduce_code(op: &ReduceKind) -> i64 {
    match op {
        ReduceKind::Add => 0,
        ReduceKind::Mul => 1,
        ReduceKind::Function(_) => 2,
    }
}

/// The task function being emitted and the runtime handles it was given.
#[derive(Debug)]
struct Frame {
    span: Span,
    ctx: ValueId,
    runtime: ValueId,
    /// Slot holding the current point of an index task.
    index: Option<ValueId>,
}

/// Distributed backend: every task is registered with the runtime, launches
/// go through task launchers and the runtime orders them by the regions and
/// futures they were handed.
#[derive(Debug, Default)]
pub struct LegionTasker {
    tasks: TaskTable,
    registered: BTreeSet<String>,
    started: bool,
    frames: Vec<Frame>,
}

impl LegionTasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.registered.contains(task)
    }

    fn span(&self) -> Span {
        self.frames.last().map(|f| f.span).unwrap_or_else(no_span)
    }

    fn rt(&self, b: &mut Builder, name: &str, args: Vec<ValueId>) -> Result<Option<ValueId>, ContraError> {
        runtime::call(b, name, args, self.span())
    }

    /// `ctx` and `runtime` of the enclosing task, null outside of one.
    fn handles(&self, b: &mut Builder) -> Result<(ValueId, ValueId), ContraError> {
        match self.frames.last() {
            Some(f) => Ok((f.ctx, f.runtime)),
            None => Ok((b.null(Type::Void)?, b.null(Type::Void)?)),
        }
    }

    fn spill(&self, b: &mut Builder, name: &str, value: ValueId) -> Result<ValueId, ContraError> {
        let ty = b.type_of(value)?;
        let slot = b.alloca(name, ty)?;
        b.store(slot, value)?;
        Ok(slot)
    }

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

    fn unregistered(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .filter(|t| !self.registered.contains(&t.name))
            .cloned()
            .collect()
    }

    /// Hands each launch argument to the launcher: fields as regions, plain
    /// values as futures, handles and arrays by value. Returns the futures
    /// made here for plain values, which the caller releases after the launch.
    fn add_args(
        &mut self,
        b: &mut Builder,
        launcher: ValueId,
        args: &[LaunchArg],
    ) -> Result<Vec<ValueId>, ContraError> {
        let mut made = Vec::new();
        for arg in args {
            let stored = pointee(b, arg.value)?;
            match self.kind_of(&stored) {
                Some(ResourceKind::Field) => {
                    let part = match arg.partition {
                        Some(p) => p,
                        None => b.null(Type::Void)?,
                    };
                    self.rt(b, LAUNCHER_ADD_REGION, vec![launcher, arg.value, part])?;
                }
                Some(ResourceKind::Future) => {
                    self.rt(b, LAUNCHER_ADD_FUTURE, vec![launcher, arg.value])?;
                }
                // Each point unpacks the partition and takes its own piece.
                Some(ResourceKind::Range) => {
                    let value = arg.partition.unwrap_or(arg.value);
                    let handle = pointee(b, value)?;
                    let bytes = b.size_of(handle)?;
                    self.rt(b, LAUNCHER_ADD_ARG, vec![launcher, value, bytes])?;
                }
                Some(ResourceKind::Partition) => {
                    let bytes = b.size_of(stored)?;
                    self.rt(b, LAUNCHER_ADD_ARG, vec![launcher, arg.value, bytes])?;
                }
                Some(ResourceKind::Accessor) => {
                    return Err(ContraError::implementation(
                        "an accessor cannot be handed to a task",
                        self.span(),
                    ));
                }
                None if matches!(stored, Type::Array(_)) => {
                    let bytes = b.size_of(stored)?;
                    self.rt(b, LAUNCHER_ADD_ARG, vec![launcher, arg.value, bytes])?;
                }
                None => {
                    let value = b.load(arg.value)?;
                    let future = self.create_future(b, "__arg", &stored)?;
                    self.to_future(b, value, future)?;
                    self.rt(b, LAUNCHER_ADD_FUTURE, vec![launcher, future])?;
                    made.push(future);
                }
            }
        }
        Ok(made)
    }
}

impl Tasker for LegionTasker {
    fn name(&self) -> &'static str {
        "legion"
    }

    // The value type lives in the runtime's buffer, not in the handle.
    fn future_type(&mut self, b: &mut Builder, _value: &Type) -> Result<Type, ContraError> {
        opaque(b, FUTURE_T)
    }

    fn range_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        opaque(b, INDEX_SPACE_T)
    }

    fn field_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        opaque(b, FIELD_T)
    }

    fn partition_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        opaque(b, PARTITION_T)
    }

    fn accessor_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        opaque(b, ACCESSOR_T)
    }

    fn kind_of(&self, ty: &Type) -> Option<ResourceKind> {
        match ty.struct_name()? {
            FUTURE_T => Some(ResourceKind::Future),
            INDEX_SPACE_T => Some(ResourceKind::Range),
            FIELD_T => Some(ResourceKind::Field),
            PARTITION_T => Some(ResourceKind::Partition),
            ACCESSOR_T => Some(ResourceKind::Accessor),
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

    fn preregister_tasks(&mut self, b: &mut Builder) -> Result<(), ContraError> {
        let pending = self.unregistered();
        for t in &pending {
            let id = b.const_i64(i64::from(t.id))?;
            let name = b.const_str(&t.name)?;
            let body = b.function_ref(&t.function)?;
            let index = b.const_i64(i64::from(t.index))?;
            self.rt(b, REGISTER_TASK, vec![id, name, body, index])?;
            self.registered.insert(t.name.clone());
        }
        debug!(tasks = pending.len(), "register tasks");
        Ok(())
    }

    /// Registers tasks defined after the runtime started, from inside the
    /// running program.
    fn postregister_tasks(&mut self, b: &mut Builder) -> Result<(), ContraError> {
        let pending = self.unregistered();
        for t in &pending {
            let (ctx, runtime) = self.handles(b)?;
            let id = b.const_i64(i64::from(t.id))?;
            let name = b.const_str(&t.name)?;
            let body = b.function_ref(&t.function)?;
            let index = b.const_i64(i64::from(t.index))?;
            self.rt(b, POSTREGISTER_TASK, vec![ctx, runtime, id, name, body, index])?;
            self.registered.insert(t.name.clone());
        }
        trace!(tasks = pending.len(), "late task registration");
        Ok(())
    }

    fn set_top_level_task(&mut self, b: &mut Builder, task: &TaskInfo) -> Result<(), ContraError> {
        let id = b.const_i64(i64::from(task.id))?;
        self.rt(b, SET_TOP_LEVEL_TASK, vec![id])?;
        Ok(())
    }

    fn start(&mut self, b: &mut Builder, args: &[String]) -> Result<(), ContraError> {
        let mut call = vec![b.const_i64(args.len() as i64 + 1)?, b.const_str("contra")?];
        for a in args {
            call.push(b.const_str(a)?);
        }
        self.rt(b, START, call)?;
        self.started = true;
        debug!(argc = args.len() + 1, "runtime started");
        Ok(())
    }

    fn stop(&mut self, b: &mut Builder) -> Result<(), ContraError> {
        self.rt(b, FINALIZE, Vec::new())?;
        Ok(())
    }

    fn task_preamble(
        &mut self,
        b: &mut Builder,
        name: &str,
        span: Span,
        args: &[TaskArg],
        index: bool,
        _results: &[Type],
    ) -> Result<TaskWrapper, ContraError> {
        let params = ["__task", "__regions", "__num_regions", "__ctx", "__runtime"]
            .into_iter()
            .map(|p| {
                let ty = if p == "__num_regions" { Type::I64 } else { Type::void_ptr() };
                (p.to_string(), ty)
            })
            .collect();
        let values = b.begin_function(name, span, params, Type::Void);
        let &[task, regions, num_regions, ctx, runtime] = values.as_slice() else {
            return Err(ContraError::implementation(
                format!("task '{name}' wrapper has the wrong shape"),
                span,
            ));
        };

        let point = if index {
            let p = self
                .rt(b, GET_INDEX_POINT, vec![task])?
                .ok_or_else(|| ContraError::implementation("index point has no value", span))?;
            Some(self.spill(b, "__index", p)?)
        } else {
            None
        };
        self.frames.push(Frame {
            span,
            ctx,
            runtime,
            index: point,
        });

        // Plain values come through the task's futures, handles and arrays
        // through its argument buffer, accessors through its regions. Each
        // has its own count, in the order the launch added them.
        let (mut position, mut future, mut region) = (0i64, 0i64, 0i64);
        let mut slots = Vec::with_capacity(args.len());
        for a in args {
            let slot = b.alloca(&a.name, a.ty.clone())?;
            match self.kind_of(&a.ty) {
                Some(ResourceKind::Accessor) => {
                    let at = b.const_i64(region)?;
                    self.rt(b, GET_ACCESSOR, vec![regions, num_regions, at, ctx, runtime, slot])?;
                    region += 1;
                }
                Some(ResourceKind::Range | ResourceKind::Partition) => {
                    let at = b.const_i64(position)?;
                    self.rt(b, UNPACK_ARG, vec![task, at, slot])?;
                    position += 1;
                }
                None if matches!(a.ty, Type::Array(_)) => {
                    let at = b.const_i64(position)?;
                    self.rt(b, UNPACK_ARG, vec![task, at, slot])?;
                    position += 1;
                }
                None => {
                    let at = b.const_i64(future)?;
                    let bytes = b.size_of(a.ty.clone())?;
                    self.rt(b, UNPACK_FUTURE, vec![task, at, slot, bytes])?;
                    future += 1;
                }
                Some(kind @ (ResourceKind::Field | ResourceKind::Future)) => {
                    return Err(ContraError::implementation(
                        format!("task '{name}' cannot take '{}' as a {kind:?}", a.name),
                        span,
                    ));
                }
            }
            let slot = match (a.piece, point) {
                (true, Some(at)) => {
                    let ty = self.range_type(b)?;
                    let piece = b.alloca(&a.name, ty)?;
                    let at = b.load(at)?;
                    self.rt(b, PARTITION_PIECE, vec![ctx, runtime, slot, at, piece])?;
                    piece
                }
                _ => slot,
            };
            slots.push(slot);
        }
        trace!(task = name, values = position, futures = future, regions = region, "task preamble");
        Ok(TaskWrapper {
            args: slots,
            index: point,
        })
    }

    fn task_postamble(&mut self, b: &mut Builder, results: &[ValueId]) -> Result<(), ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        let count = b.const_i64(results.len() as i64)?;
        let mut call = vec![runtime, ctx, count];
        for r in results {
            let ty = b.type_of(*r)?;
            let slot = self.spill(b, "__result", *r)?;
            call.push(slot);
            call.push(b.size_of(ty)?);
        }
        self.rt(b, TASK_POSTAMBLE, call)?;
        if !b.is_terminated() {
            b.ret(None)?;
        }
        self.frames.pop();
        Ok(())
    }

    fn launch(&mut self, b: &mut Builder, launch: Launch) -> Result<Option<ValueId>, ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        let ty = opaque(b, LAUNCHER_T)?;
        let launcher = b.alloca("__launcher", ty)?;
        let id = b.const_i64(i64::from(launch.task.id))?;
        let range = match launch.range {
            Some(r) => r,
            None => b.null(Type::Void)?,
        };
        self.rt(b, LAUNCHER_CREATE, vec![id, range, launcher])?;
        let made = self.add_args(b, launcher, &launch.args)?;

        let result = if launch.range.is_none() {
            let future = match launch.task.result() {
                Some(_) => {
                    let ty = self.future_type(b, &Type::Void)?;
                    Some(b.alloca("__future", ty)?)
                }
                None => None,
            };
            let out = match future {
                Some(f) => f,
                None => b.null(Type::Void)?,
            };
            self.rt(b, EXECUTE_TASK, vec![ctx, runtime, launcher, out])?;
            future
        } else {
            let ty = opaque(b, FUTURE_MAP_T)?;
            let map = b.alloca("__future_map", ty)?;
            self.rt(b, EXECUTE_INDEX_TASK, vec![ctx, runtime, launcher, map])?;
            for (k, r) in launch.reductions.iter().enumerate() {
                let at = b.const_i64(k as i64)?;
                let code = b.const_i64(reduce_code(&r.op))?;
                let combiner = match &r.op {
                    ReduceKind::Function(f) => b.function_ref(f)?,
                    _ => b.null(Type::Void)?,
                };
                let bytes = b.size_of(r.ty.clone())?;
                self.rt(
                    b,
                    FUTURE_MAP_REDUCE,
                    vec![ctx, runtime, map, at, code, combiner, r.slot, bytes],
                )?;
            }
            self.rt(b, FUTURE_MAP_DESTROY, vec![map])?;
            None
        };
        self.destroy_futures(b, &made)?;
        self.rt(b, LAUNCHER_DESTROY, vec![launcher])?;
        debug!(
            task = %launch.task.name,
            index = launch.range.is_some(),
            reductions = launch.reductions.len(),
            "task launch"
        );
        Ok(result)
    }

    fn create_future(&mut self, b: &mut Builder, name: &str, value: &Type) -> Result<ValueId, ContraError> {
        let ty = self.future_type(b, value)?;
        Ok(b.alloca(name, ty)?)
    }

    fn to_future(&mut self, b: &mut Builder, value: ValueId, future: ValueId) -> Result<(), ContraError> {
        let ty = b.type_of(value)?;
        let slot = self.spill(b, "__value", value)?;
        let bytes = b.size_of(ty)?;
        self.rt(b, FUTURE_FROM_VALUE, vec![slot, bytes, future])?;
        Ok(())
    }

    fn copy_future(&mut self, b: &mut Builder, src: ValueId, dst: ValueId) -> Result<(), ContraError> {
        self.rt(b, FUTURE_COPY, vec![src, dst])?;
        Ok(())
    }

    fn load_future(&mut self, b: &mut Builder, future: ValueId, value: &Type) -> Result<ValueId, ContraError> {
        let out = b.alloca("__result", value.clone())?;
        let bytes = b.size_of(value.clone())?;
        self.rt(b, FUTURE_GET_RESULT, vec![future, out, bytes])?;
        Ok(b.load(out)?)
    }

    fn destroy_future(&mut self, b: &mut Builder, future: ValueId) -> Result<(), ContraError> {
        self.rt(b, FUTURE_DESTROY, vec![future])?;
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
        let (ctx, runtime) = self.handles(b)?;
        let ty = self.range_type(b)?;
        let range = b.alloca(name, ty)?;
        let label = b.const_str(name)?;
        let step = match step {
            Some(s) => s,
            None => b.const_i64(1)?,
        };
        self.rt(
            b,
            INDEX_SPACE_CREATE,
            vec![ctx, runtime, label, start, end, step, range],
        )?;
        Ok(range)
    }

    fn range_size(&mut self, b: &mut Builder, range: ValueId) -> Result<ValueId, ContraError> {
        self.rt(b, INDEX_SPACE_SIZE, vec![range])?
            .ok_or_else(|| ContraError::implementation("index space size has no value", self.span()))
    }

    fn load_range_value(&mut self, b: &mut Builder, range: ValueId, index: ValueId) -> Result<ValueId, ContraError> {
        self.rt(b, INDEX_SPACE_POINT, vec![range, index])?
            .ok_or_else(|| ContraError::implementation("index space point has no value", self.span()))
    }

    fn destroy_range(&mut self, b: &mut Builder, range: ValueId) -> Result<(), ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        self.rt(b, INDEX_SPACE_DESTROY, vec![ctx, runtime, range])?;
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
        let (ctx, runtime) = self.handles(b)?;
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
        self.rt(b, create, vec![ctx, runtime, label, bytes, init, extent, field])?;
        Ok(())
    }

    fn destroy_field(&mut self, b: &mut Builder, field: ValueId) -> Result<(), ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        self.rt(b, FIELD_DESTROY, vec![ctx, runtime, field])?;
        Ok(())
    }

    fn partition(
        &mut self,
        b: &mut Builder,
        range: ValueId,
        colors: ValueId,
        by_count: bool,
    ) -> Result<ValueId, ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        let ty = self.partition_type(b)?;
        let part = b.alloca("__part", ty)?;
        let create = if by_count {
            PARTITION_FROM_SIZE
        } else {
            PARTITION_FROM_ARRAY
        };
        self.rt(b, create, vec![ctx, runtime, colors, range, part])?;
        Ok(part)
    }

    fn destroy_partition(&mut self, b: &mut Builder, part: ValueId) -> Result<(), ContraError> {
        let (ctx, runtime) = self.handles(b)?;
        self.rt(b, PARTITION_DESTROY, vec![ctx, runtime, part])?;
        Ok(())
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
        self.rt(b, ACCESSOR_WRITE, vec![accessor, point, input])?;
        Ok(())
    }

    fn destroy_accessor(&mut self, b: &mut Builder, accessor: ValueId) -> Result<(), ContraError> {
        self.rt(b, ACCESSOR_DESTROY, vec![accessor])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contra_ir::{InstKind, validate_module};

    fn in_function(b: &mut Builder) {
        b.begin_function("main", no_span(), Vec::new(), Type::Void);
    }

    fn finish(b: &mut Builder) -> Vec<String> {
        b.ret(None).unwrap();
        b.finish_function().unwrap();
        b.module().functions["main"]
            .callees()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn wrapper_counts_futures_handles_and_regions_separately() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        let acc = l.accessor_type(&mut b).unwrap();
        let range = l.range_type(&mut b).unwrap();
        let args = vec![
            TaskArg::new("a", acc),
            TaskArg::new("x", Type::F64),
            TaskArg::new("r", range),
            TaskArg::new("y", Type::I64),
        ];
        let w = l
            .task_preamble(&mut b, "t_loop0", no_span(), &args, true, &[])
            .unwrap();
        assert_eq!(w.args.len(), 4);
        assert!(w.index.is_some());
        l.task_postamble(&mut b, &[]).unwrap();
        b.finish_function().unwrap();

        let f = &b.module().functions["t_loop0"];
        assert_eq!(f.params.len(), 5);
        assert_eq!(f.ret, Type::Void);
        assert_eq!(
            f.callees(),
            [
                GET_INDEX_POINT,
                GET_ACCESSOR,
                UNPACK_FUTURE,
                UNPACK_ARG,
                UNPACK_FUTURE,
                TASK_POSTAMBLE
            ]
        );
        // The second plain value is the second future, not the third argument.
        let positions: Vec<i64> = f
            .insts()
            .filter_map(|i| match &i.kind {
                InstKind::Const(contra_ir::Constant::I64(v)) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(&positions[..4], [0, 0, 0, 1]);
        validate_module(b.module()).unwrap();
    }

    #[test]
    fn piece_of_a_partition_is_handed_to_the_body_as_a_range() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        let part = l.partition_type(&mut b).unwrap();
        let w = l
            .task_preamble(&mut b, "t_loop0", no_span(), &[TaskArg::piece("r", part)], true, &[])
            .unwrap();
        assert!(l.is_range(&pointee(&b, w.args[0]).unwrap()));
        l.task_postamble(&mut b, &[]).unwrap();
        b.finish_function().unwrap();
        assert_eq!(
            b.module().functions["t_loop0"].callees(),
            [GET_INDEX_POINT, UNPACK_ARG, PARTITION_PIECE, TASK_POSTAMBLE]
        );
        validate_module(b.module()).unwrap();
    }

    #[test]
    fn tasks_are_registered_once() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        l.tasks_mut().insert("a", "a", false, Vec::new(), Vec::new());
        in_function(&mut b);
        l.preregister_tasks(&mut b).unwrap();
        l.tasks_mut().insert("b", "b", false, Vec::new(), Vec::new());
        l.postregister_tasks(&mut b).unwrap();
        l.postregister_tasks(&mut b).unwrap();
        let callees = finish(&mut b);
        assert_eq!(callees, [REGISTER_TASK, POSTREGISTER_TASK]);
        assert!(l.is_registered("a") && l.is_registered("b"));
    }

    #[test]
    fn single_launch_with_a_result_yields_a_future() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        let task = l
            .tasks_mut()
            .insert("f", "f", false, vec![TaskArg::new("n", Type::I64)], vec![Type::I64]);
        in_function(&mut b);
        let n = b.alloca("n", Type::I64).unwrap();
        let future = l
            .launch(
                &mut b,
                Launch {
                    task,
                    args: vec![LaunchArg {
                        value: n,
                        partition: None,
                    }],
                    range: None,
                    reductions: Vec::new(),
                    span: no_span(),
                },
            )
            .unwrap()
            .unwrap();
        assert!(l.is_future(&pointee(&b, future).unwrap()));
        let callees = finish(&mut b);
        // A plain value travels as a future made for the launch.
        assert_eq!(
            callees,
            [
                LAUNCHER_CREATE,
                FUTURE_FROM_VALUE,
                LAUNCHER_ADD_FUTURE,
                EXECUTE_TASK,
                FUTURE_DESTROY,
                LAUNCHER_DESTROY
            ]
        );
    }

    #[test]
    fn partitioned_range_is_replaced_by_its_partition() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        let part_ty = l.partition_type(&mut b).unwrap();
        let task = l.tasks_mut().insert(
            "t_loop0",
            "t_loop0",
            true,
            vec![TaskArg::piece("r", part_ty)],
            Vec::new(),
        );
        in_function(&mut b);
        let (start, end) = (b.const_i64(0).unwrap(), b.const_i64(9).unwrap());
        let range = l.create_range(&mut b, "r", start, end, None).unwrap();
        let colors = b.const_i64(2).unwrap();
        let part = l.partition(&mut b, range, colors, true).unwrap();
        l.launch(
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
        finish(&mut b);

        let main = &b.module().functions["main"];
        let added: Vec<ValueId> = main
            .insts()
            .filter_map(|i| match &i.kind {
                InstKind::Call { callee, args } if callee == LAUNCHER_ADD_ARG => Some(args[1]),
                _ => None,
            })
            .collect();
        assert_eq!(added, [part]);
    }

    #[test]
    fn index_launch_reduces_each_target() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        let task = l
            .tasks_mut()
            .insert("t_loop0", "t_loop0", true, Vec::new(), vec![Type::F64, Type::I64]);
        in_function(&mut b);
        let (start, end) = (b.const_i64(0).unwrap(), b.const_i64(9).unwrap());
        let range = l.create_range(&mut b, "r", start, end, None).unwrap();
        let s = b.alloca("s", Type::F64).unwrap();
        let c = b.alloca("c", Type::I64).unwrap();
        let reductions = vec![
            contra_core::ReductionTarget {
                name: "s".into(),
                slot: s,
                op: ReduceKind::Add,
                ty: Type::F64,
            },
            contra_core::ReductionTarget {
                name: "c".into(),
                slot: c,
                op: ReduceKind::Function("max".into()),
                ty: Type::I64,
            },
        ];
        let out = l
            .launch(
                &mut b,
                Launch {
                    task,
                    args: Vec::new(),
                    range: Some(range),
                    reductions,
                    span: no_span(),
                },
            )
            .unwrap();
        assert!(out.is_none());
        let callees = finish(&mut b);
        let reduces = callees.iter().filter(|c| *c == FUTURE_MAP_REDUCE).count();
        assert_eq!(reduces, 2);
        let main = &b.module().functions["main"];
        assert!(main.insts().any(|i| matches!(
            &i.kind,
            InstKind::Const(contra_ir::Constant::Function(f)) if f == "max"
        )));
    }

    #[test]
    fn outside_a_task_handles_are_null() {
        let mut l = LegionTasker::new();
        let mut b = Builder::new("m");
        in_function(&mut b);
        let size = b.const_i64(4).unwrap();
        let field = l.create_field(&mut b, "a", &Type::I64, size, None).unwrap();
        l.destroy_field(&mut b, field).unwrap();
        let callees = finish(&mut b);
        assert_eq!(callees, [FIELD_CREATE, FIELD_DESTROY]);
        validate_module(b.module()).unwrap();
    }
}
