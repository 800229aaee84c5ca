use anyhow::{anyhow, Result};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::ast::Node;

use super::define_main;

/// Lower `root` and return relocatable object bytes for the host machine.
/// The builtins stay undefined symbols, resolved by the system linker.
pub fn emit(module_name: &str, root: &Node) -> Result<Vec<u8>> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("is_pic", "true")
        .map_err(|err| anyhow!("failed to set codegen flag: {err:?}"))?;
    let isa_builder =
        cranelift_native::builder().map_err(|msg| anyhow!("host machine is not supported: {msg}"))?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder))?;

    let builder = ObjectBuilder::new(
        isa,
        module_name.to_owned(),
        cranelift_module::default_libcall_names(),
    )?;
    let mut module = ObjectModule::new(builder);

    define_main(&mut module, root)?;

    let product = module.finish();
    Ok(product.emit()?)
}
