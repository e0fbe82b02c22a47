//! Lowering passes for cinder
//!
//! Rewrites method bodies that contain anonymous functions or `yield`
//! statements into plain methods, fields and explicit state transitions:
//! - `capture`: which variables cross function boundaries
//! - `closure`: closure types holding captured state
//! - `lambda`: anonymous functions into methods and delegate constructions
//! - `iterator`: generator bodies into enumerator state machines
//! - `normalizer`: runs the passes over a method or a whole module

pub mod capture;
pub mod closure;
pub mod error;
pub mod iterator;
pub mod lambda;
pub mod normalizer;
pub mod options;
pub mod subst;

pub use capture::{analyze, CaptureInfo, Var};
pub use error::{LowerError, Result};
pub use iterator::IteratorClosure;
pub use lambda::Member;
pub use normalizer::{normalize_method, normalize_module, NormalizedMethod};
pub use options::LowerOptions;
pub use subst::Substitution;
