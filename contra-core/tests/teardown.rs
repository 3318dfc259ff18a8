use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use contra_ast::build::*;
use contra_ast::{ContraError, Item, Span};
use contra_core::{
    Analyzer, CodeGen, FutureFlow, Launch, Lifter, ResourceKind, TaskArg, TaskTable, TaskWrapper,
    Tasker,
};
use contra_ir::{BinOp, Builder, Type, ValueId};

/// Contract calls seen so far, by operation.
#[derive(Clone, Debug, Default)]
struct Counts(Rc<RefCell<BTreeMap<&'static str, usize>>>);

impl Counts {
    fn bump(&self, op: &'static str) {
        *self.0.borrow_mut().entry(op).or_default() += 1;
    }

    fn get(&self, op: &str) -> usize {
        self.0.borrow().get(op).copied().unwrap_or(0)
    }
}

/// A backend that emits just enough IR to stay well formed and records
/// every contract call it receives.
struct Recorder {
    counts: Counts,
    tasks: TaskTable,
    started: bool,
    index: Vec<Option<ValueId>>,
}

impl Recorder {
    fn new(counts: Counts) -> Self {
        Self {
            counts,
            tasks: TaskTable::new(),
            started: false,
            index: Vec::new(),
        }
    }

    fn spill(b: &mut Builder, name: &str, v: ValueId) -> Result<ValueId, ContraError> {
        let ty = b.type_of(v)?;
        let slot = b.alloca(name, ty)?;
        b.store(slot, v)?;
        Ok(slot)
    }
}

impl Tasker for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn future_type(&mut self, b: &mut Builder, value: &Type) -> Result<Type, ContraError> {
        let name = format!("rec_future_{}", value.display().replace(['[', ']', '*'], "_"));
        Ok(b.declare_struct(&name, vec![value.clone()])?)
    }

    fn range_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct("rec_range", vec![Type::I64, Type::I64])?)
    }

    fn field_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct("rec_field", vec![Type::I64])?)
    }

    fn partition_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct("rec_partition", vec![Type::I64])?)
    }

    fn accessor_type(&mut self, b: &mut Builder) -> Result<Type, ContraError> {
        Ok(b.declare_struct("rec_accessor", vec![Type::I64])?)
    }

    fn kind_of(&self, ty: &Type) -> Option<ResourceKind> {
        match ty.struct_name()? {
            "rec_range" => Some(ResourceKind::Range),
            "rec_field" => Some(ResourceKind::Field),
            "rec_partition" => Some(ResourceKind::Partition),
            "rec_accessor" => Some(ResourceKind::Accessor),
            n if n.starts_with("rec_future_") => Some(ResourceKind::Future),
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

    fn preregister_tasks(&mut self, _b: &mut Builder) -> Result<(), ContraError> {
        self.counts.bump("preregister_tasks");
        Ok(())
    }

    fn postregister_tasks(&mut self, _b: &mut Builder) -> Result<(), ContraError> {
        self.counts.bump("postregister_tasks");
        Ok(())
    }

    fn set_top_level_task(&mut self, _b: &mut Builder, _task: &contra_core::TaskInfo) -> Result<(), ContraError> {
        self.counts.bump("set_top_level_task");
        Ok(())
    }

    fn start(&mut self, _b: &mut Builder, _args: &[String]) -> Result<(), ContraError> {
        self.counts.bump("start");
        self.started = true;
        Ok(())
    }

    fn stop(&mut self, _b: &mut Builder) -> Result<(), ContraError> {
        self.counts.bump("stop");
        Ok(())
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
        self.counts.bump("task_preamble");
        let ret = results.first().cloned().unwrap_or(Type::Void);
        let mut params: Vec<(String, Type)> = Vec::new();
        if index {
            params.push(("__index".to_string(), Type::I64));
        }
        params.extend(args.iter().map(|a| (a.name.clone(), a.ty.clone())));
        let values = b.begin_function(name, span, params, ret);

        let mut values = values.into_iter();
        let point = match values.next().filter(|_| index) {
            Some(v) => Some(Self::spill(b, "__index", v)?),
            None => None,
        };
        let mut slots = Vec::with_capacity(args.len());
        for (a, v) in args.iter().zip(values) {
            slots.push(Self::spill(b, &a.name, v)?);
        }
        self.index.push(point);
        Ok(TaskWrapper { args: slots, index: point })
    }

    fn task_postamble(&mut self, b: &mut Builder, results: &[ValueId]) -> Result<(), ContraError> {
        self.counts.bump("task_postamble");
        if !b.is_terminated() {
            b.ret(results.first().copied())?;
        }
        self.index.pop();
        Ok(())
    }

    fn launch(&mut self, b: &mut Builder, launch: Launch) -> Result<Option<ValueId>, ContraError> {
        if launch.range.is_some() {
            self.counts.bump("launch_index");
            return Ok(None);
        }
        self.counts.bump("launch");
        let mut values = Vec::with_capacity(launch.args.len());
        for (arg, param) in launch.args.iter().zip(&launch.task.args) {
            let stored = match b.type_of(arg.value)? {
                Type::Ptr(t) => *t,
                other => other,
            };
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
        self.counts.bump("create_future");
        let ty = self.future_type(b, value)?;
        Ok(b.alloca(name, ty)?)
    }

    fn to_future(&mut self, b: &mut Builder, value: ValueId, future: ValueId) -> Result<(), ContraError> {
        self.counts.bump("to_future");
        let slot = b.field_ptr(future, 0)?;
        Ok(b.store(slot, value)?)
    }

    fn copy_future(&mut self, b: &mut Builder, src: ValueId, dst: ValueId) -> Result<(), ContraError> {
        self.counts.bump("copy_future");
        Ok(b.memcopy(dst, src)?)
    }

    fn load_future(&mut self, b: &mut Builder, future: ValueId, value: &Type) -> Result<ValueId, ContraError> {
        self.counts.bump("load_future");
        let slot = b.field_ptr(future, 0)?;
        let v = b.load(slot)?;
        Ok(b.cast(v, value.clone())?)
    }

    fn destroy_future(&mut self, _b: &mut Builder, _future: ValueId) -> Result<(), ContraError> {
        self.counts.bump("destroy_future");
        Ok(())
    }

    fn create_range(
        &mut self,
        b: &mut Builder,
        name: &str,
        start: ValueId,
        end: ValueId,
        _step: Option<ValueId>,
    ) -> Result<ValueId, ContraError> {
        self.counts.bump("create_range");
        let ty = self.range_type(b)?;
        let range = b.alloca(name, ty)?;
        for (i, v) in [start, end].into_iter().enumerate() {
            let slot = b.field_ptr(range, i as u32)?;
            b.store(slot, v)?;
        }
        Ok(range)
    }

    fn range_size(&mut self, b: &mut Builder, range: ValueId) -> Result<ValueId, ContraError> {
        let start = b.field_ptr(range, 0)?;
        let start = b.load(start)?;
        let end = b.field_ptr(range, 1)?;
        let end = b.load(end)?;
        Ok(b.binary(BinOp::Sub, end, start)?)
    }

    fn load_range_value(&mut self, b: &mut Builder, range: ValueId, index: ValueId) -> Result<ValueId, ContraError> {
        let start = b.field_ptr(range, 0)?;
        let start = b.load(start)?;
        Ok(b.binary(BinOp::Add, start, index)?)
    }

    fn destroy_range(&mut self, _b: &mut Builder, _range: ValueId) -> Result<(), ContraError> {
        self.counts.bump("destroy_range");
        Ok(())
    }

    fn init_field(
        &mut self,
        _b: &mut Builder,
        _field: ValueId,
        _name: &str,
        _value: &Type,
        _extent: ValueId,
        _init: Option<ValueId>,
    ) -> Result<(), ContraError> {
        self.counts.bump("init_field");
        Ok(())
    }

    fn destroy_field(&mut self, _b: &mut Builder, _field: ValueId) -> Result<(), ContraError> {
        self.counts.bump("destroy_field");
        Ok(())
    }

    fn partition(
        &mut self,
        b: &mut Builder,
        _range: ValueId,
        _colors: ValueId,
        _by_count: bool,
    ) -> Result<ValueId, ContraError> {
        self.counts.bump("partition");
        let ty = self.partition_type(b)?;
        Ok(b.alloca("__part", ty)?)
    }

    fn destroy_partition(&mut self, _b: &mut Builder, _part: ValueId) -> Result<(), ContraError> {
        self.counts.bump("destroy_partition");
        Ok(())
    }

    fn load_accessor(
        &mut self,
        b: &mut Builder,
        _accessor: ValueId,
        value: &Type,
        _index: Option<ValueId>,
    ) -> Result<ValueId, ContraError> {
        self.counts.bump("load_accessor");
        let out = b.alloca("__read", value.clone())?;
        Ok(b.load(out)?)
    }

    fn store_accessor(
        &mut self,
        _b: &mut Builder,
        _accessor: ValueId,
        _value: ValueId,
        _index: Option<ValueId>,
    ) -> Result<(), ContraError> {
        self.counts.bump("store_accessor");
        Ok(())
    }

    fn destroy_accessor(&mut self, _b: &mut Builder, _accessor: ValueId) -> Result<(), ContraError> {
        self.counts.bump("destroy_accessor");
        Ok(())
    }
}

/// Runs items through analysis, future marking, lifting and generation.
fn compile(items: Vec<Item>) -> (Counts, CodeGen) {
    let counts = Counts::default();
    let mut analyzer = Analyzer::new();
    let mut flow = FutureFlow::new();
    let mut lifter = Lifter::new();
    let mut cg = CodeGen::new("test", Box::new(Recorder::new(counts.clone())));
    for mut item in items {
        analyzer.analyze(&mut item).unwrap();
        flow.run(&mut item);
        for decl in lifter.lift(&mut item) {
            let mut lifted = Item::IndexTask(decl);
            analyzer.analyze(&mut lifted).unwrap();
            flow.run(&mut lifted);
            cg.generate(&lifted).unwrap();
        }
        let depth = cg.storage_depth();
        cg.generate(&item).unwrap();
        assert_eq!(cg.storage_depth(), depth, "unbalanced scopes in {}", item.name());
    }
    (counts, cg)
}

fn producer() -> Item {
    Item::Function(task(
        proto("produce", vec![], Some(scalar("i64"))),
        vec![],
        Some(int(7)),
    ))
}

#[test]
fn each_owned_resource_is_destroyed_once() {
    let body = vec![
        decl("a", None, array(vec![int(1), int(2)])),
        assign(var("f"), call("produce", vec![])),
        decl("r", None, range(int(0), int(3))),
    ];
    let user = Item::Function(task(proto("user", vec![], None), body, None));
    let (counts, cg) = compile(vec![producer(), user]);

    assert_eq!(counts.get("launch"), 1);
    assert_eq!(counts.get("destroy_future"), 1);
    assert_eq!(counts.get("destroy_range"), 1);
    let dealloc = cg.module().functions["user"]
        .callees()
        .into_iter()
        .filter(|c| *c == "deallocate")
        .count();
    assert_eq!(dealloc, 1);
}

#[test]
fn unbound_temporaries_are_released_with_their_scope() {
    let body = vec![
        expr(range(int(0), int(5))),
        if_else(boolean(true), vec![expr(range(int(1), int(2)))], vec![]),
    ];
    let (counts, _) = compile(vec![Item::Function(function(proto("f", vec![], None), body, None))]);
    assert_eq!(counts.get("create_range"), 2);
    assert_eq!(counts.get("destroy_range"), 2);
}

#[test]
fn future_marks_follow_assignments() {
    let body = vec![
        assign(var("a"), call("produce", vec![])),
        assign(var("b"), var("a")),
        assign(var("c"), int(5)),
        assign(var("c"), var("b")),
    ];
    let user = Item::Function(task(proto("user", vec![], None), body, None));
    let (counts, _) = compile(vec![producer(), user]);

    // `a` adopts the launch result.
    assert_eq!(counts.get("create_future"), 3);
    assert_eq!(counts.get("copy_future"), 2);
    assert_eq!(counts.get("destroy_future"), 3);
    assert_eq!(counts.get("load_future"), 0);
}

#[test]
fn annotated_declaration_resolves_the_future() {
    let body = vec![
        assign(var("f"), call("produce", vec![])),
        decl("g", Some(scalar("i64")), var("f")),
    ];
    let user = Item::Function(task(proto("user", vec![], None), body, None));
    let (counts, _) = compile(vec![producer(), user]);
    assert_eq!(counts.get("load_future"), 1);
    assert_eq!(counts.get("destroy_future"), 1);
}

#[test]
fn partitions_and_their_ranges_are_torn_down() {
    let body = vec![
        decl("r", None, range(int(0), int(9))),
        decl("p", None, call("part", vec![var("r"), int(2)])),
    ];
    let (counts, _) = compile(vec![Item::Function(function(proto("f", vec![], None), body, None))]);
    assert_eq!(counts.get("partition"), 1);
    assert_eq!(counts.get("destroy_partition"), 1);
    assert_eq!(counts.get("destroy_range"), 1);
}

#[test]
fn indexed_field_store_outside_a_loop_recreates_the_field() {
    let body = vec![
        decl_many(&["x"], Some(field_of("i64")), Some(int(4)), int(0)),
        assign(index("x", int(8)), int(1)),
    ];
    let (counts, _) = compile(vec![Item::Function(function(proto("f", vec![], None), body, None))]);
    assert_eq!(counts.get("init_field"), 2);
    assert_eq!(counts.get("destroy_field"), 2);
}

#[test]
fn globals_outlive_the_top_level_scope() {
    let top = top_level(vec![decl("r", None, range(int(0), int(3)))], None);
    let (counts, cg) = compile(vec![Item::Function(top)]);
    assert_eq!(counts.get("create_range"), 1);
    assert_eq!(counts.get("destroy_range"), 0);
    assert!(cg.module().globals.contains_key("r"));
}

#[test]
fn entry_task_call_drives_the_runtime_lifecycle() {
    let main = Item::Function(task(proto("main_task", vec![], None), vec![], None));
    let top = Item::Function(top_level(vec![expr(call("main_task", vec![]))], None));
    let (counts, mut cg) = compile(vec![main, top]);
    for op in ["preregister_tasks", "set_top_level_task", "start", "stop"] {
        assert_eq!(counts.get(op), 1, "{op}");
    }
    assert!(cg.tasker().is_started());

    // Later top-level code registers tasks defined after the start.
    let mut analyzer = Analyzer::new();
    let mut later = Item::Function(top_level(vec![], None));
    analyzer.analyze(&mut later).unwrap();
    cg.remove_function("__anon_expr");
    cg.generate(&later).unwrap();
    assert_eq!(counts.get("postregister_tasks"), 1);
}
