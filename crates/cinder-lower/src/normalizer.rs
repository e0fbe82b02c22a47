//! Per-method lowering driver

use cinder_ir::Module;
use cinder_types::{MethodId, TypeDefId};
use log::{debug, info};

use crate::capture::analyze;
use crate::error::{LowerError, Result};
use crate::iterator::{lower_iterator, IteratorClosure};
use crate::lambda::{lower_anonymous_functions, ClosureConversion, Member};
use crate::options::LowerOptions;
use crate::subst::qualified_name;

/// What lowering one method produced
#[derive(Debug, Clone)]
pub struct NormalizedMethod {
    pub method: MethodId,
    /// Closure types, in creation order
    pub closure_types: Vec<TypeDefId>,
    pub iterator: Option<IteratorClosure>,
    /// Members added to the method's own type
    pub peer_members: Vec<Member>,
}

impl NormalizedMethod {
    fn unchanged(method: MethodId) -> Self {
        Self {
            method,
            closure_types: Vec::new(),
            iterator: None,
            peer_members: Vec::new(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.closure_types.is_empty() && self.iterator.is_none() && self.peer_members.is_empty()
    }

    /// Every synthesized type, in discovery order.
    pub fn new_types(&self) -> Vec<TypeDefId> {
        let mut types = self.closure_types.clone();
        types.extend(self.iterator.as_ref().map(|it| it.def));
        types
    }
}

/// Lower the anonymous functions and `yield` statements of one method body.
///
/// A body with neither comes back untouched.
pub fn normalize_method(
    module: &mut Module,
    method: MethodId,
    options: &LowerOptions,
) -> Result<NormalizedMethod> {
    let mut body = module
        .method_mut(method)
        .body
        .take()
        .ok_or_else(|| LowerError::MissingBody {
            method: qualified_name(module, method),
        })?;

    let info = match analyze(module, method, &mut body) {
        Ok(info) => info,
        Err(err) => {
            module.method_mut(method).body = Some(body);
            return Err(err);
        }
    };
    let lower_yields = info.has_yield() && options.lower_iterators;
    if !info.has_functions() && !lower_yields {
        module.method_mut(method).body = Some(body);
        return Ok(NormalizedMethod::unchanged(method));
    }

    let name = qualified_name(module, method);
    debug!(
        "{}: {} anonymous functions, {} yield sites",
        name,
        info.functions.len(),
        info.yield_count
    );

    let conversion = if info.has_functions() {
        lower_anonymous_functions(module, method, &mut body, &info, options)?
    } else {
        ClosureConversion::default()
    };

    let iterator = if lower_yields {
        let number = conversion.closure_types.len() + 1;
        let (replacement, closure) = lower_iterator(module, method, body, number)?;
        body = replacement;
        Some(closure)
    } else {
        None
    };
    module.method_mut(method).body = Some(body);

    let result = NormalizedMethod {
        method,
        closure_types: conversion.closure_types,
        iterator,
        peer_members: conversion.peer_members,
    };
    info!(
        "lowered {}: {} closure types, {} peer members{}",
        name,
        result.closure_types.len(),
        result.peer_members.len(),
        if result.iterator.is_some() {
            ", iterator state machine"
        } else {
            ""
        }
    );
    Ok(result)
}

/// Lower every method of the module that has a body.
///
/// Methods synthesized along the way are already lowered and are not revisited.
/// Only methods that changed are reported.
pub fn normalize_module(module: &mut Module, options: &LowerOptions) -> Result<Vec<NormalizedMethod>> {
    let mut lowered = Vec::new();
    for method in module.methods_with_bodies() {
        let result = normalize_method(module, method, options)?;
        if !result.is_unchanged() {
            lowered.push(result);
        }
    }
    Ok(lowered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_ir::builder::{decl, expr, invoke, local, ret};
    use cinder_ir::{print_method, Stmt};

    #[test]
    fn test_plain_method_is_untouched() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let int = module.types.int32();
        let method = module.add_method(class, "M", int, true);
        let x = module.add_local("x", int);
        let one = module.int(1);
        module.set_body(method, vec![decl(x, Some(one)), ret(Some(local(x)))]);
        let before = module.method(method).body.clone();
        let type_count = module.type_defs.len();

        let result = normalize_method(&mut module, method, &LowerOptions::default()).unwrap();

        assert!(result.is_unchanged());
        assert!(result.new_types().is_empty());
        assert_eq!(module.method(method).body, before);
        assert_eq!(module.type_defs.len(), type_count);
    }

    #[test]
    fn test_missing_body_is_reported() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let void = module.types.void();
        let method = module.add_method(class, "Abstract", void, false);

        let err = normalize_method(&mut module, method, &LowerOptions::default()).unwrap_err();
        assert_eq!(
            err,
            LowerError::MissingBody {
                method: "C::Abstract".to_string()
            }
        );
    }

    #[test]
    fn test_closures_inside_iterator() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let int = module.types.int32();
        let seq = module.types.instance(module.platform.generic_enumerable, vec![int]);
        let method = module.add_method(class, "Values", seq, false);
        let k = module.add_local("k", int);
        let one = module.int(1);
        let f = module.lambda(vec![], int, vec![ret(Some(local(k)))]);
        let delegate = match &f {
            cinder_ir::Expr::Lambda(f) => f.delegate_type,
            _ => unreachable!(),
        };
        let d = module.add_local("f", delegate);
        module.set_body(
            method,
            vec![
                decl(k, Some(one)),
                decl(d, Some(f)),
                Stmt::YieldReturn(invoke(local(d), vec![])),
            ],
        );

        let result = normalize_method(&mut module, method, &LowerOptions::default()).unwrap();

        assert_eq!(result.closure_types.len(), 1);
        let it = result.iterator.as_ref().unwrap();
        assert_eq!(result.new_types(), vec![result.closure_types[0], it.def]);
        assert_eq!(module.type_def(it.def).name, "<Values>ic__2");

        let text = print_method(&module, it.move_next);
        assert!(text.contains("this.<>__CS$<>8__locals12 = new <Values>c__DisplayClass1();"));
        assert!(text.contains("this.<>__CS$<>8__locals12.k = 1;"));
        assert!(text.contains("(this.<>__CS$<>8__locals12.<Values>b__1)"));
        assert!(text.contains("this.<>__current = this.<>__f2();"));
        assert_eq!(module.validate(), Ok(()));
    }

    #[test]
    fn test_iterators_can_be_left_in_place() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let int = module.types.int32();
        let seq = module.types.instance(module.platform.generic_enumerable, vec![int]);
        let method = module.add_method(class, "Values", seq, true);
        let one = module.int(1);
        module.set_body(method, vec![Stmt::YieldReturn(one)]);
        let options = LowerOptions {
            lower_iterators: false,
            ..LowerOptions::default()
        };

        let result = normalize_method(&mut module, method, &options).unwrap();

        assert!(result.is_unchanged());
        assert!(matches!(
            module.method(method).body.as_ref().unwrap().stmts[0],
            Stmt::YieldReturn(_)
        ));
    }

    #[test]
    fn test_module_reports_changed_methods_only() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let void = module.types.void();
        let plain = module.add_method(class, "Plain", void, true);
        module.set_body(plain, vec![ret(None)]);
        let with_lambda = module.add_method(class, "WithLambda", void, true);
        let f = module.lambda(vec![], void, vec![ret(None)]);
        module.set_body(with_lambda, vec![expr(invoke(f, vec![]))]);

        let lowered = normalize_module(&mut module, &LowerOptions::default()).unwrap();

        assert_eq!(lowered.len(), 1);
        assert_eq!(lowered[0].method, with_lambda);
        let peer = module.find_method(class, "<WithLambda>p__1").unwrap();
        assert!(module.method(peer).body.is_some());
    }
}
