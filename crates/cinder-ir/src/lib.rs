//! Intermediate representation for cinder
//!
//! Method bodies are trees of statements and expressions over flat,
//! id-indexed arenas of types, methods, fields, locals and parameters.
//! The lowering passes in `cinder-lower` consume and produce this form.

pub mod builder;
pub mod ir;
pub mod platform;
pub mod print;
pub mod validate;
pub mod visit;

pub use ir::*;
pub use platform::Platform;
pub use print::{print_block, print_expr, print_method, print_module, type_name};
pub use validate::IrError;
pub use visit::{Visit, VisitMut};
