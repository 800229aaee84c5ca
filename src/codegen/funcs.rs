use std::collections::HashMap;

use cranelift_codegen::ir::{types, AbiParam, FuncRef, Signature};
use cranelift_module::{FuncId, Module};

/// Everything known about a callable name.
///
/// `id`/`func_ref` stay unset until the first call site declares the function
/// into the module.
pub struct FuncInfo {
    pub sig: Signature,
    pub is_builtin: bool,
    pub is_defined: bool,
    pub id: Option<FuncId>,
    pub func_ref: Option<FuncRef>,
}

impl FuncInfo {
    fn builtin(sig: Signature) -> Self {
        Self {
            sig,
            is_builtin: true,
            is_defined: false,
            id: None,
            func_ref: None,
        }
    }

    /// A recognized name with no compiled body; calling it is an error.
    pub fn undefined(sig: Signature) -> Self {
        Self {
            sig,
            is_builtin: false,
            is_defined: false,
            id: None,
            func_ref: None,
        }
    }
}

pub struct FuncTable {
    entries: HashMap<String, FuncInfo>,
}

impl FuncTable {
    /// Table pre-populated with the builtin set.
    pub fn with_builtins<M: Module>(module: &M) -> Self {
        let mut entries = HashMap::new();

        // char input: no arguments, i8 result widened at the call site
        let mut sig = module.make_signature();
        sig.returns.push(AbiParam::new(types::I8));
        entries.insert("getchar".to_string(), FuncInfo::builtin(sig));

        // char output: one int argument, no result
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(types::I32));
        entries.insert("putchar".to_string(), FuncInfo::builtin(sig));

        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&FuncInfo> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: &str, info: FuncInfo) {
        self.entries.insert(name.to_string(), info);
    }

    /// Cache the lazily-created module declaration for `name`.
    pub fn bind(&mut self, name: &str, id: FuncId, func_ref: FuncRef) {
        if let Some(info) = self.entries.get_mut(name) {
            info.id = Some(id);
            info.func_ref = Some(func_ref);
        }
    }
}
