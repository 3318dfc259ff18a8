use contra::{BackendKind, CompileOptions, Compiler};
use contra_ast::build::*;
use contra_ast::{BinOp, ErrorKind, Item, ProtoKind, ReduceOp, Stmt};
use contra_ir::{InstKind, ValueId};

fn compiler(kind: BackendKind) -> Compiler {
    let mut options = CompileOptions::default();
    options.backend.kind = kind;
    Compiler::new("test", options)
}

fn calls(c: &Compiler, function: &str, callee: &str) -> usize {
    let f = &c.module().functions[function];
    f.callees().into_iter().filter(|n| *n == callee).count()
}

fn callees(c: &Compiler, function: &str) -> Vec<String> {
    let f = &c.module().functions[function];
    f.callees().into_iter().map(str::to_string).collect()
}

/// Arguments of every call to `callee` in `function`, in order.
fn call_args(c: &Compiler, function: &str, callee: &str) -> Vec<Vec<ValueId>> {
    c.module().functions[function]
        .insts()
        .filter_map(|i| match &i.kind {
            InstKind::Call { callee: name, args } if name == callee => Some(args.clone()),
            _ => None,
        })
        .collect()
}

fn producer() -> Item {
    Item::Function(task(
        proto("produce", vec![], Some(scalar("i64"))),
        vec![],
        Some(int(7)),
    ))
}

#[test]
fn mixed_arithmetic_is_cast_to_real() {
    for kind in [BackendKind::Kokkos, BackendKind::Legion] {
        let mut c = compiler(kind);
        let add = function(
            proto(
                "add",
                vec![param("x", scalar("i64")), param("y", scalar("f64"))],
                Some(scalar("f64")),
            ),
            vec![],
            Some(binary(BinOp::Add, var("x"), var("y"))),
        );
        let names = c.compile(Item::Function(add)).unwrap();
        assert_eq!(names, ["add"]);

        let f = &c.module().functions["add"];
        assert!(
            f.insts()
                .any(|i| matches!(i.kind, InstKind::Cast { .. })),
            "no cast in:\n{}",
            contra_ir::render_function(f)
        );
    }
}

#[test]
fn backend_follows_the_config() {
    let options = CompileOptions::from_toml_str("[backend]\nkind = \"legion\"\n").unwrap();
    assert_eq!(Compiler::new("m", options).backend(), "legion");
    assert_eq!(compiler(BackendKind::Kokkos).backend(), "kokkos");
}

#[test]
fn entry_task_starts_the_runtime_on_kokkos() {
    let mut c = compiler(BackendKind::Kokkos);
    let main = task(
        proto("main_task", vec![], None),
        vec![expr(call("print", vec![string("hello\n")]))],
        None,
    );
    c.compile(Item::Function(main)).unwrap();
    let names = c
        .compile(Item::Function(top_level(vec![expr(call("main_task", vec![]))], None)))
        .unwrap();
    assert_eq!(names, ["__anon_expr"]);
    assert_eq!(
        callees(&c, "__anon_expr"),
        ["contra_kokkos_runtime_start", "main_task", "contra_kokkos_runtime_stop"]
    );
    assert!(c.analyzer().have_top_level_task());
}

#[test]
fn entry_task_registers_everything_on_legion() {
    let mut c = compiler(BackendKind::Legion);
    c.compile(producer()).unwrap();
    c.compile(Item::Function(task(proto("main_task", vec![], None), vec![], None)))
        .unwrap();
    c.compile(Item::Function(top_level(vec![expr(call("main_task", vec![]))], None)))
        .unwrap();

    assert_eq!(calls(&c, "__anon_expr", "contra_legion_register_task"), 2);
    assert_eq!(calls(&c, "__anon_expr", "contra_legion_set_top_level_task_id"), 1);
    assert_eq!(calls(&c, "__anon_expr", "contra_legion_start"), 1);
}

#[test]
fn only_one_entry_task_per_program() {
    let mut c = compiler(BackendKind::Kokkos);
    c.compile(Item::Function(task(proto("main_task", vec![], None), vec![], None)))
        .unwrap();
    c.compile(Item::Function(top_level(vec![expr(call("main_task", vec![]))], None)))
        .unwrap();

    let err = c
        .compile(Item::Function(top_level(vec![expr(call("main_task", vec![]))], None)))
        .unwrap_err();
    let err = err.as_contra().expect("a compile error");
    assert_eq!(err.kind(), ErrorKind::Name);
    assert!(err.message().contains("more than one top-level task"), "unexpected error: {err}");
}

#[test]
fn futures_flow_through_assignments() {
    let mut c = compiler(BackendKind::Legion);
    c.compile(producer()).unwrap();
    let body = vec![
        assign(var("a"), call("produce", vec![])),
        assign(var("b"), var("a")),
        assign(var("c"), int(5)),
        assign(var("c"), var("b")),
    ];
    c.compile(Item::Function(task(proto("consumer", vec![], None), body, None)))
        .unwrap();

    // `a` adopts the launch result; `b` and `c` each hold their own copy.
    assert_eq!(calls(&c, "consumer", "contra_legion_execute_task"), 1);
    assert_eq!(calls(&c, "consumer", "contra_legion_future_copy"), 2);
    assert_eq!(calls(&c, "consumer", "contra_legion_future_destroy"), 3);
    assert_eq!(calls(&c, "consumer", "contra_legion_future_get_result"), 0);
}

#[test]
fn typed_declaration_waits_on_a_future() {
    let mut c = compiler(BackendKind::Legion);
    c.compile(producer()).unwrap();
    let body = vec![
        assign(var("f"), call("produce", vec![])),
        decl("g", Some(scalar("i64")), var("f")),
    ];
    c.compile(Item::Function(task(proto("waiter", vec![], None), body, None)))
        .unwrap();
    assert_eq!(calls(&c, "waiter", "contra_legion_future_get_result"), 1);
    assert_eq!(calls(&c, "waiter", "contra_legion_future_destroy"), 1);
}

#[test]
fn every_owned_resource_is_released_once() {
    let mut c = compiler(BackendKind::Legion);
    let depth = c.codegen().storage_depth();
    let body = vec![
        decl("a", None, array(vec![int(1), int(2), int(3)])),
        decl("r", None, range(int(0), int(9))),
    ];
    c.compile(Item::Function(function(proto("f", vec![], None), body, None)))
        .unwrap();

    assert_eq!(calls(&c, "f", "allocate"), 1);
    assert_eq!(calls(&c, "f", "deallocate"), 1);
    assert_eq!(calls(&c, "f", "contra_legion_index_space_create"), 1);
    assert_eq!(calls(&c, "f", "contra_legion_index_space_destroy"), 1);
    assert_eq!(c.codegen().storage_depth(), depth);
}

#[test]
fn parallel_reduction_is_lifted_into_an_index_task() {
    let mut c = compiler(BackendKind::Kokkos);
    let mut fe = foreach(
        "i",
        counted(int(0), int(9), None, true),
        vec![assign(var("s"), binary(BinOp::Add, var("s"), var("i")))],
    );
    fe.reductions.push(reduce(ReduceOp::Op(BinOp::Add), &["s"]));
    let body = vec![decl("s", None, int(0)), Stmt::Foreach(fe)];
    let sum = task(proto("sum", vec![], Some(scalar("i64"))), body, Some(var("s")));

    let names = c.compile(Item::Function(sum)).unwrap();
    assert_eq!(names, ["sum_loop0", "sum"]);
    assert_eq!(calls(&c, "sum", "contra_kokkos_parallel_reduce"), 1);
    assert!(c.codegen().tasker().is_task("sum_loop0"));
}

#[test]
fn failed_item_leaves_the_session_clean() {
    let mut c = compiler(BackendKind::Kokkos);
    let depth = c.codegen().storage_depth();
    let broken = function(
        proto("f", vec![], Some(scalar("i64"))),
        vec![],
        Some(var("missing")),
    );
    let err = c.compile(Item::Function(broken)).unwrap_err();
    assert!(err.to_string().contains("missing"), "unexpected error: {err}");
    assert!(c.analyzer().context().find_function("f").is_none());
    assert!(!c.module().functions.contains_key("f"));
    assert_eq!(c.codegen().storage_depth(), depth);

    let fixed = function(proto("f", vec![], Some(scalar("i64"))), vec![], Some(int(1)));
    assert_eq!(c.compile(Item::Function(fixed)).unwrap(), ["f"]);
}

#[test]
fn removed_functions_can_be_redefined() {
    let mut c = compiler(BackendKind::Kokkos);
    let make = |v| function(proto("f", vec![], Some(scalar("i64"))), vec![], Some(int(v)));

    c.compile(Item::Function(make(1))).unwrap();
    assert!(c.compile(Item::Function(make(2))).is_err());
    assert!(c.module().functions.contains_key("f"));

    assert!(c.remove_function("f"));
    assert!(!c.module().functions.contains_key("f"));
    c.compile(Item::Function(make(3))).unwrap();
    assert!(!c.remove_function("g"));
}

fn two_loops(second: &[&str]) -> Item {
    let mut first = foreach(
        "i",
        counted(int(0), int(3), None, true),
        vec![assign(var("a"), binary(BinOp::Add, var("a"), var("i")))],
    );
    first.reductions.push(reduce(ReduceOp::Op(BinOp::Add), &["a"]));
    let mut again = foreach(
        "j",
        counted(int(0), int(3), None, true),
        second
            .iter()
            .map(|v| assign(var(v), binary(BinOp::Add, var(v), var("j"))))
            .collect(),
    );
    again.reductions.push(reduce(ReduceOp::Op(BinOp::Add), second));
    let body = vec![
        decl("a", None, int(0)),
        decl("b", None, int(0)),
        Stmt::Foreach(first),
        Stmt::Foreach(again),
    ];
    Item::Function(task(proto("t", vec![], None), body, None))
}

#[test]
fn failed_loop_leaves_no_lifted_tasks_behind() {
    let mut c = compiler(BackendKind::Kokkos);
    let err = c.compile(two_loops(&["a", "b"])).unwrap_err();
    assert!(err.to_string().contains("returns 2 values"), "unexpected error: {err}");
    assert!(!c.module().functions.contains_key("t_loop0"));
    assert!(!c.codegen().tasker().is_task("t_loop0"));
    assert!(c.analyzer().context().find_function("t").is_none());

    let names = c.compile(two_loops(&["b"])).unwrap();
    assert_eq!(names, ["t_loop0", "t_loop1", "t"]);
    assert_eq!(calls(&c, "t", "contra_kokkos_parallel_reduce"), 2);
}

#[test]
fn field_is_read_and_written_by_element_inside_a_loop() {
    for (kind, prefix) in [(BackendKind::Kokkos, "contra_kokkos"), (BackendKind::Legion, "contra_legion")] {
        let mut c = compiler(kind);
        let fe = foreach(
            "i",
            counted(int(0), int(7), None, true),
            vec![
                assign(var("x"), var("i")),
                assign(index("x", var("i")), binary(BinOp::Add, var("x"), int(1))),
            ],
        );
        let body = vec![
            decl_many(&["x"], Some(field_of("f64")), Some(int(8)), real(0.0)),
            Stmt::Foreach(fe),
        ];
        let names = c
            .compile(Item::Function(task(proto("t", vec![], None), body, None)))
            .unwrap();
        assert_eq!(names, ["t_loop0", "t"]);

        let write = format!("{prefix}_accessor_write");
        let read = format!("{prefix}_accessor_read");
        assert_eq!(calls(&c, "t_loop0", &write), 2, "{}", c.backend());
        assert_eq!(calls(&c, "t_loop0", &read), 1, "{}", c.backend());
    }
}

#[test]
fn partitioned_range_reaches_the_launch_as_its_partition() {
    for kind in [BackendKind::Kokkos, BackendKind::Legion] {
        let mut c = compiler(kind);
        let fe = foreach(
            "i",
            over(var("r")),
            vec![
                partition(&["r"], call("part", vec![var("r"), int(2)])),
                for_loop("j", over(var("r")), vec![]),
            ],
        );
        let body = vec![decl("r", None, range(int(0), int(9))), Stmt::Foreach(fe)];
        let names = c
            .compile(Item::Function(task(proto("t", vec![], None), body, None)))
            .unwrap();
        assert_eq!(names, ["t_loop0", "t"]);

        let prefix = format!("contra_{}", c.backend());
        let made = call_args(&c, "t", &format!("{prefix}_partition_from_size"));
        let part = *made[0].last().unwrap();
        let handed: Vec<ValueId> = match kind {
            BackendKind::Kokkos => call_args(&c, "t", "contra_kokkos_parallel_for")
                .into_iter()
                .flat_map(|args| args[4..].to_vec())
                .collect(),
            BackendKind::Legion => call_args(&c, "t", "contra_legion_task_launcher_add_arg")
                .into_iter()
                .map(|args| args[1])
                .collect(),
        };
        assert_eq!(handed, [part], "{}", c.backend());
        assert_eq!(calls(&c, "t_loop0", &format!("{prefix}_partition_piece")), 1);
    }
}

#[test]
fn user_operator_operands_are_cast_to_its_parameters() {
    for kind in [BackendKind::Kokkos, BackendKind::Legion] {
        let mut c = compiler(kind);
        let mut op = proto(
            "binary|",
            vec![param("l", scalar("i64")), param("r", scalar("f64"))],
            Some(scalar("f64")),
        );
        op.kind = ProtoKind::BinaryOp { op: '|', precedence: 5 };
        c.compile(Item::Function(function(
            op,
            vec![],
            Some(binary(BinOp::Add, var("l"), var("r"))),
        )))
        .unwrap();

        let apply = function(
            proto("apply", vec![], Some(scalar("f64"))),
            vec![],
            Some(binary(BinOp::User('|'), real(1.5), int(2))),
        );
        c.compile(Item::Function(apply)).unwrap();
        let f = &c.module().functions["apply"];
        let casts = f
            .insts()
            .filter(|i| matches!(i.kind, InstKind::Cast { .. }))
            .count();
        assert_eq!(casts, 2, "in:\n{}", contra_ir::render_function(f));
        assert_eq!(calls(&c, "apply", "binary|"), 1);
    }
}

#[test]
fn legion_task_takes_a_future_argument() {
    let mut c = compiler(BackendKind::Legion);
    c.compile(producer()).unwrap();
    let twice = task(
        proto("twice", vec![param("x", scalar("i64"))], Some(scalar("i64"))),
        vec![],
        Some(binary(BinOp::Mul, var("x"), int(2))),
    );
    c.compile(Item::Function(twice)).unwrap();
    assert_eq!(calls(&c, "twice", "contra_legion_unpack_future"), 1);
    assert_eq!(calls(&c, "twice", "contra_legion_unpack_arg"), 0);

    let body = vec![
        assign(var("f"), call("produce", vec![])),
        assign(var("g"), call("twice", vec![var("f")])),
        assign(var("h"), call("twice", vec![int(3)])),
    ];
    c.compile(Item::Function(task(proto("chain", vec![], None), body, None)))
        .unwrap();
    assert_eq!(calls(&c, "chain", "contra_legion_task_launcher_add_future"), 2);
    assert_eq!(calls(&c, "chain", "contra_legion_future_from_value"), 1);
    assert_eq!(calls(&c, "chain", "contra_legion_task_launcher_add_arg"), 0);
}
