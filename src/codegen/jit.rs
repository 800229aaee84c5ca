use anyhow::Result;
use cranelift_jit::{JITBuilder, JITModule};

use crate::ast::Node;

use super::{define_main, runtime};

type EntryFn = extern "C" fn() -> i32;

/// A lowered, finalized program plus the pretty-printed IR of its `main`.
pub struct CompiledProgram {
    // keeps the executable memory alive for as long as `entry` may run
    _module: JITModule,
    entry: EntryFn,
    pub clif: String,
}

/// Lower `root` into an in-process module with the builtins bound to the
/// runtime shims.
pub fn prepare(root: &Node) -> Result<CompiledProgram> {
    let mut builder = JITBuilder::new(cranelift_module::default_libcall_names())?;
    runtime::register_builtin_symbols(&mut builder);
    let mut module = JITModule::new(builder);

    let main = define_main(&mut module, root)?;
    module.finalize_definitions()?;

    let entry = module.get_finalized_function(main.id);
    let entry: EntryFn = unsafe { std::mem::transmute(entry) };

    Ok(CompiledProgram {
        _module: module,
        entry,
        clif: main.clif,
    })
}

impl CompiledProgram {
    pub fn run(&self) -> i32 {
        (self.entry)()
    }
}
