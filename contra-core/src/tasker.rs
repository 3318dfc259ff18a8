//! The contract every parallel backend implements. The code generator only
//! ever talks to a backend through [`Tasker`]; it never inspects handle
//! layouts itself and asks [`Tasker::kind_of`] what a storage slot holds.

use std::collections::BTreeMap;

use contra_ast::{ContraError, Span};
use contra_ir::{Builder, Type, ValueId};

/// What kind of backend resource a storage slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Future,
    Field,
    Range,
    Accessor,
    Partition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskArg {
    pub name: String,
    /// The type the task body sees; field captures arrive as accessors.
    pub ty: Type,
    /// Set on a partition handed to an index task in place of a range. The
    /// preamble gives the body the current point's piece as a range.
    pub piece: bool,
}

impl TaskArg {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            piece: false,
        }
    }

    pub fn piece(name: impl Into<String>, partition: Type) -> Self {
        Self {
            name: name.into(),
            ty: partition,
            piece: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskInfo {
    pub id: u32,
    pub name: String,
    /// IR function holding the wrapped body.
    pub function: String,
    pub index: bool,
    pub args: Vec<TaskArg>,
    pub results: Vec<Type>,
}

impl TaskInfo {
    /// The single value a plain task hands back, if any.
    pub fn result(&self) -> Option<&Type> {
        if self.index { None } else { self.results.first() }
    }
}

/// Every task registered with a backend, keyed by name. Ids are handed out
/// in registration order and survive re-registration of the same name.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: BTreeMap<String, TaskInfo>,
    next_id: u32,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: &str,
        function: &str,
        index: bool,
        args: Vec<TaskArg>,
        results: Vec<Type>,
    ) -> TaskInfo {
        let id = match self.tasks.get(name) {
            Some(existing) => existing.id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        let info = TaskInfo {
            id,
            name: name.to_string(),
            function: function.to_string(),
            index,
            args,
            results,
        };
        self.tasks.insert(name.to_string(), info.clone());
        info
    }

    pub fn get(&self, name: &str) -> Option<&TaskInfo> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TaskInfo> {
        self.tasks.remove(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskInfo> {
        let mut tasks: Vec<&TaskInfo> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.id);
        tasks.into_iter()
    }
}

/// Storage a task preamble set up for the body.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskWrapper {
    /// One pointer per [`TaskArg`], in order.
    pub args: Vec<ValueId>,
    /// Pointer to the current point of an index launch.
    pub index: Option<ValueId>,
}

/// One argument to a launch: a pointer to the caller's storage, plus the
/// partition that splits it. A partitioned field is handed over region by
/// region; a partitioned range is replaced by its partition.
#[derive(Clone, Debug, PartialEq)]
pub struct LaunchArg {
    pub value: ValueId,
    pub partition: Option<ValueId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReduceKind {
    Add,
    Mul,
    /// A two-argument function that combines partial results.
    Function(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReductionTarget {
    pub name: String,
    /// Caller storage that receives the combined value.
    pub slot: ValueId,
    pub op: ReduceKind,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Launch {
    pub task: TaskInfo,
    pub args: Vec<LaunchArg>,
    /// Index space for an index launch; `None` launches a single task.
    pub range: Option<ValueId>,
    pub reductions: Vec<ReductionTarget>,
    pub span: Span,
}

pub trait Tasker {
    fn name(&self) -> &'static str;

    /// IR types of the backend's handles. Implementations declare whatever
    /// structs they need on the module the first time they are asked.
    fn future_type(&mut self, b: &mut Builder, value: &Type) -> Result<Type, ContraError>;
    fn range_type(&mut self, b: &mut Builder) -> Result<Type, ContraError>;
    fn field_type(&mut self, b: &mut Builder) -> Result<Type, ContraError>;
    fn partition_type(&mut self, b: &mut Builder) -> Result<Type, ContraError>;
    fn accessor_type(&mut self, b: &mut Builder) -> Result<Type, ContraError>;

    fn kind_of(&self, ty: &Type) -> Option<ResourceKind>;

    fn is_future(&self, ty: &Type) -> bool {
        self.kind_of(ty) == Some(ResourceKind::Future)
    }

    fn is_field(&self, ty: &Type) -> bool {
        self.kind_of(ty) == Some(ResourceKind::Field)
    }

    fn is_range(&self, ty: &Type) -> bool {
        self.kind_of(ty) == Some(ResourceKind::Range)
    }

    fn is_accessor(&self, ty: &Type) -> bool {
        self.kind_of(ty) == Some(ResourceKind::Accessor)
    }

    fn is_partition(&self, ty: &Type) -> bool {
        self.kind_of(ty) == Some(ResourceKind::Partition)
    }

    fn tasks(&self) -> &TaskTable;
    fn tasks_mut(&mut self) -> &mut TaskTable;

    fn is_task(&self, name: &str) -> bool {
        self.tasks().contains(name)
    }

    fn get_task(&self, name: &str, span: Span) -> Result<TaskInfo, ContraError> {
        self.tasks().get(name).cloned().ok_or_else(|| {
            ContraError::implementation(format!("task '{name}' has not been registered"), span)
        })
    }

    fn is_started(&self) -> bool;

    fn preregister_tasks(&mut self, b: &mut Builder) -> Result<(), ContraError>;
    fn postregister_tasks(&mut self, b: &mut Builder) -> Result<(), ContraError>;
    fn set_top_level_task(&mut self, b: &mut Builder, task: &TaskInfo) -> Result<(), ContraError>;
    /// Hands control to the runtime, which runs the entry task.
    fn start(&mut self, b: &mut Builder, args: &[String]) -> Result<(), ContraError>;
    fn stop(&mut self, b: &mut Builder) -> Result<(), ContraError>;

    /// Opens the IR function for a task and unpacks its arguments.
    fn task_preamble(
        &mut self,
        b: &mut Builder,
        name: &str,
        span: Span,
        args: &[TaskArg],
        index: bool,
        results: &[Type],
    ) -> Result<TaskWrapper, ContraError>;

    /// Hands `results` back to the runtime and terminates the task function.
    fn task_postamble(&mut self, b: &mut Builder, results: &[ValueId]) -> Result<(), ContraError>;

    /// Returns the pointer to a fresh future for a plain launch of a task
    /// with a result.
    fn launch(&mut self, b: &mut Builder, launch: Launch) -> Result<Option<ValueId>, ContraError>;

    /// Storage for a future holding a `value`; not yet set.
    fn create_future(&mut self, b: &mut Builder, name: &str, value: &Type) -> Result<ValueId, ContraError>;
    fn to_future(&mut self, b: &mut Builder, value: ValueId, future: ValueId) -> Result<(), ContraError>;
    fn copy_future(&mut self, b: &mut Builder, src: ValueId, dst: ValueId) -> Result<(), ContraError>;
    /// Blocks until the future is ready and returns its value.
    fn load_future(&mut self, b: &mut Builder, future: ValueId, value: &Type) -> Result<ValueId, ContraError>;
    fn destroy_future(&mut self, b: &mut Builder, future: ValueId) -> Result<(), ContraError>;

    /// `end` is inclusive; a missing `step` means 1.
    fn create_range(
        &mut self,
        b: &mut Builder,
        name: &str,
        start: ValueId,
        end: ValueId,
        step: Option<ValueId>,
    ) -> Result<ValueId, ContraError>;
    fn range_size(&mut self, b: &mut Builder, range: ValueId) -> Result<ValueId, ContraError>;
    fn load_range_value(&mut self, b: &mut Builder, range: ValueId, index: ValueId) -> Result<ValueId, ContraError>;
    fn destroy_range(&mut self, b: &mut Builder, range: ValueId) -> Result<(), ContraError>;

    fn create_field(
        &mut self,
        b: &mut Builder,
        name: &str,
        value: &Type,
        extent: ValueId,
        init: Option<ValueId>,
    ) -> Result<ValueId, ContraError> {
        let ty = self.field_type(b)?;
        let field = b.alloca(name, ty)?;
        self.init_field(b, field, name, value, extent, init)?;
        Ok(field)
    }

    /// `extent` is either an i64 size or a pointer to a range.
    fn init_field(
        &mut self,
        b: &mut Builder,
        field: ValueId,
        name: &str,
        value: &Type,
        extent: ValueId,
        init: Option<ValueId>,
    ) -> Result<(), ContraError>;
    fn destroy_field(&mut self, b: &mut Builder, field: ValueId) -> Result<(), ContraError>;

    /// Splits `range` into `colors` blocks when `by_count`, otherwise by the
    /// i64 colouring array `colors` points to.
    fn partition(
        &mut self,
        b: &mut Builder,
        range: ValueId,
        colors: ValueId,
        by_count: bool,
    ) -> Result<ValueId, ContraError>;
    fn destroy_partition(&mut self, b: &mut Builder, part: ValueId) -> Result<(), ContraError>;

    fn load_accessor(
        &mut self,
        b: &mut Builder,
        accessor: ValueId,
        value: &Type,
        index: Option<ValueId>,
    ) -> Result<ValueId, ContraError>;
    fn store_accessor(
        &mut self,
        b: &mut Builder,
        accessor: ValueId,
        value: ValueId,
        index: Option<ValueId>,
    ) -> Result<(), ContraError>;
    fn destroy_accessor(&mut self, b: &mut Builder, accessor: ValueId) -> Result<(), ContraError>;

    fn destroy_futures(&mut self, b: &mut Builder, futures: &[ValueId]) -> Result<(), ContraError> {
        for f in futures {
            self.destroy_future(b, *f)?;
        }
        Ok(())
    }

    fn destroy_fields(&mut self, b: &mut Builder, fields: &[ValueId]) -> Result<(), ContraError> {
        for f in fields {
            self.destroy_field(b, *f)?;
        }
        Ok(())
    }

    fn destroy_accessors(&mut self, b: &mut Builder, accessors: &[ValueId]) -> Result<(), ContraError> {
        for a in accessors {
            self.destroy_accessor(b, *a)?;
        }
        Ok(())
    }

    fn destroy_partitions(&mut self, b: &mut Builder, parts: &[ValueId]) -> Result<(), ContraError> {
        for p in parts {
            self.destroy_partition(b, *p)?;
        }
        Ok(())
    }

    fn destroy_ranges(&mut self, b: &mut Builder, ranges: &[ValueId]) -> Result<(), ContraError> {
        for r in ranges {
            self.destroy_range(b, *r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reregistering_keeps_the_task_id() {
        let mut table = TaskTable::new();
        let a = table.insert("a", "a", false, Vec::new(), vec![Type::I64]);
        let b = table.insert("b", "b", true, Vec::new(), Vec::new());
        let again = table.insert("a", "a", false, Vec::new(), Vec::new());
        assert_eq!(a.id, again.id);
        assert_ne!(a.id, b.id);
        assert_eq!(table.len(), 2);
        assert!(again.result().is_none());
    }

    #[test]
    fn tasks_iterate_in_registration_order() {
        let mut table = TaskTable::new();
        for name in ["zeta", "alpha", "mid"] {
            table.insert(name, name, false, Vec::new(), Vec::new());
        }
        let names: Vec<&str> = table.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn index_tasks_have_no_single_result() {
        let mut table = TaskTable::new();
        let t = table.insert("loop", "loop", true, Vec::new(), vec![Type::F64]);
        assert!(t.result().is_none());
        assert_eq!(t.results, vec![Type::F64]);
    }
}
