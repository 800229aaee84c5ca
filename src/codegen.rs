use cranelift_codegen::ir::{types, AbiParam};
use cranelift_codegen::settings;
use cranelift_codegen::verifier::verify_function;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{FuncId, Linkage, Module};
use thiserror::Error;

use crate::ast::{Node, NodeKind};

pub mod funcs;
pub mod jit;
pub mod lower;
pub mod object;
pub mod runtime;

use funcs::FuncTable;
use lower::{expect_interior, Lowerer, VarMap};

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("malformed AST: {0}")]
    MalformedAst(String),
    #[error("use of unbound variable '{0}'")]
    UnboundVariable(String),
    #[error("call to unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' expects {expected} arguments, got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("function '{0}' is not a builtin and has no compiled body")]
    UnsupportedCall(String),
    #[error("'{0}' used outside of a for loop")]
    OutsideLoop(&'static str),
    #[error("void result of '{0}' used as a value")]
    VoidOperand(String),
    #[error("generated IR failed verification: {0}")]
    Verify(String),
    #[error(transparent)]
    Module(#[from] cranelift_module::ModuleError),
}

/// Handle to the defined entry function plus its pretty-printed IR.
#[derive(Debug)]
pub struct MainFunction {
    pub id: FuncId,
    pub clif: String,
}

/// Lower the program into a single exported `main() -> int` in `module`.
pub fn define_main<M: Module>(module: &mut M, root: &Node) -> Result<MainFunction, CodegenError> {
    let mut funcs = FuncTable::with_builtins(module);
    define_main_with(module, root, &mut funcs)
}

/// As [`define_main`], with a caller-supplied function table.
pub fn define_main_with<M: Module>(
    module: &mut M,
    root: &Node,
    funcs: &mut FuncTable,
) -> Result<MainFunction, CodegenError> {
    let root = expect_interior(root, NodeKind::Root)?;
    let stmts = root
        .child(0)
        .ok_or_else(|| CodegenError::MalformedAst("root without statement list".into()))?;

    let mut sig = module.make_signature();
    sig.returns.push(AbiParam::new(types::I32));
    let id = module.declare_function("main", Linkage::Export, &sig)?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;

    let mut builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let mut vars = VarMap::new();
    let mut lowerer = Lowerer::new(&mut *module, builder, funcs);
    let terminated = lowerer.lower_stmt_list(stmts, &mut vars)?;
    if !terminated {
        // a program that runs off the end returns 0
        lowerer.emit_default_return();
    }
    lowerer.finish();

    verify_function(&ctx.func, &settings::Flags::new(settings::builder()))
        .map_err(|errors| CodegenError::Verify(errors.to_string()))?;
    let clif = ctx.func.display().to_string();

    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    Ok(MainFunction { id, clif })
}
