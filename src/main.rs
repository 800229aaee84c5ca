use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use cparse::{codegen, parser, scanner};

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        bail!("usage: cparse <source-file>");
    };
    if args.next().is_some() {
        bail!("only one input file is supported");
    }

    let source = fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
    let lines: Vec<&str> = source.lines().collect();
    let tokens = scanner::scan(&lines)?;
    let ast = parser::parse(&tokens, &lines)?;

    let module_name = module_name(&path);
    let object_bytes = codegen::object::emit(&module_name, &ast)?;
    let out_path = format!("{module_name}.o");
    fs::write(&out_path, object_bytes).with_context(|| format!("Writing {out_path}"))?;
    Ok(())
}

/// The module name is the file name with its last `.`-extension stripped.
fn module_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("out")
        .to_string()
}
