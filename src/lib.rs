pub mod ast;
pub mod codegen;
pub mod parser;
pub mod scanner;
pub mod symtab;
pub mod token;
