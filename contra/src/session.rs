use contra_ast::{ContraError, IndexTaskDecl, Item};
use contra_backend_kokkos::KokkosTasker;
use contra_backend_legion::LegionTasker;
use contra_core::{Analyzer, CodeGen, FutureFlow, Lifter, Tasker};
use contra_ir::{ModuleIR, render_function};
use tracing::{debug, instrument};

use crate::config::{BackendKind, CompileOptions};
use crate::error::CompileError;

pub fn make_tasker(kind: BackendKind) -> Box<dyn Tasker> {
    match kind {
        BackendKind::Legion => Box::new(LegionTasker::new()),
        BackendKind::Kokkos => Box::new(KokkosTasker::new()),
    }
}

/// One compilation session: items go in one at a time, in source order,
/// and accumulate in a single module.
pub struct Compiler {
    analyzer: Analyzer,
    futures: FutureFlow,
    lifter: Lifter,
    codegen: CodeGen,
    options: CompileOptions,
}

impl Compiler {
    pub fn new(module: &str, options: CompileOptions) -> Self {
        let tasker = make_tasker(options.backend.kind);
        Self::with_tasker(module, tasker, options)
    }

    pub fn with_tasker(module: &str, tasker: Box<dyn Tasker>, options: CompileOptions) -> Self {
        let mut codegen =
            CodeGen::new(module, tasker).with_runtime_args(options.runtime.args.clone());
        codegen.set_validate(options.codegen.validate);
        Self {
            analyzer: Analyzer::new(),
            futures: FutureFlow::new(),
            lifter: Lifter::new(),
            codegen,
            options,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn backend(&self) -> &'static str {
        self.codegen.tasker().name()
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn codegen(&self) -> &CodeGen {
        &self.codegen
    }

    pub fn module(&self) -> &ModuleIR {
        self.codegen.module()
    }

    pub fn into_module(self) -> ModuleIR {
        self.codegen.into_module()
    }

    /// Type-checks `item` in place, marks its futures and splits its
    /// parallel loops into index tasks, which come back analyzed.
    #[instrument(skip_all, fields(item = %item.name()))]
    pub fn analyze(&mut self, item: &mut Item) -> Result<Vec<IndexTaskDecl>, ContraError> {
        let mark = self.lifter.lifted();
        self.analyzer.analyze(item)?;
        self.futures.run(item);

        let decls = self.lifter.lift(item);
        let lifted: Vec<String> = decls.iter().map(|d| d.name.clone()).collect();
        let mut tasks = Vec::with_capacity(decls.len());
        for decl in decls {
            let mut task = Item::IndexTask(decl);
            if let Err(e) = self.analyzer.analyze(&mut task) {
                self.forget(item, &lifted, mark);
                return Err(e);
            }
            self.futures.run(&mut task);
            if let Item::IndexTask(decl) = task {
                tasks.push(decl);
            }
        }
        debug!(index_tasks = tasks.len(), "analyzed");
        Ok(tasks)
    }

    #[instrument(skip_all, fields(item = %item.name()))]
    pub fn generate(&mut self, item: &Item) -> Result<String, ContraError> {
        let name = self.codegen.generate(item)?;
        if self.options.codegen.dump_ir {
            if let Some(f) = self.codegen.module().functions.get(&name) {
                debug!(ir = %render_function(f), "generated");
            }
        }
        Ok(name)
    }

    /// Runs the whole pipeline on one item and returns the names of the IR
    /// functions it produced, index tasks first. A failure leaves the
    /// session as it was.
    pub fn compile(&mut self, mut item: Item) -> Result<Vec<String>, CompileError> {
        let mark = self.lifter.lifted();
        // A failed analysis restores the symbol tables by itself.
        let tasks = self.analyze(&mut item)?;
        let lifted: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();

        let mut names = Vec::with_capacity(tasks.len() + 1);
        for decl in tasks {
            match self.generate(&Item::IndexTask(decl)) {
                Ok(name) => names.push(name),
                Err(e) => {
                    self.forget(&item, &lifted, mark);
                    return Err(e.into());
                }
            }
        }
        match self.generate(&item) {
            Ok(name) => names.push(name),
            Err(e) => {
                self.forget(&item, &lifted, mark);
                return Err(e.into());
            }
        }
        Ok(names)
    }

    /// Drops what a failed item left behind: its symbol, the index tasks
    /// lifted out of it, and their names.
    fn forget(&mut self, item: &Item, lifted: &[String], mark: u32) {
        for name in lifted {
            self.codegen.remove_function(name);
        }
        self.analyzer.remove_function(item.name());
        self.lifter.rewind(mark);
        debug!(item = %item.name(), lifted = lifted.len(), "rolled back");
    }

    /// Forgets a function so it can be declared and generated again.
    pub fn remove_function(&mut self, name: &str) -> bool {
        let analyzed = self.analyzer.remove_function(name);
        let generated = self.codegen.remove_function(name);
        analyzed || generated
    }
}
