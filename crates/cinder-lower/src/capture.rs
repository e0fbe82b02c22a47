//! Scope and capture analysis
//!
//! One traversal of a method body numbers every block and anonymous function,
//! records where each variable is declared, and works out which variables
//! anonymous functions capture from enclosing functions.

use std::collections::{HashMap, HashSet};

use cinder_ir::visit::{walk_expr_mut, walk_stmt_mut, VisitMut};
use cinder_ir::{AnonymousFunction, Block, Expr, FnId, Module, ScopeId, Stmt};
use cinder_types::{LocalId, MethodId, ParamId};
use log::trace;

use crate::error::{LowerError, Result};
use crate::subst::qualified_name;

/// A variable that can be captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Var {
    Local(LocalId),
    Param(ParamId),
    /// The receiver of an instance method
    This,
}

impl Var {
    pub fn describe(self, module: &Module) -> String {
        match self {
            Var::Local(id) => module.local(id).name.clone(),
            Var::Param(id) => module.param(id).name.clone(),
            Var::This => "this".to_string(),
        }
    }
}

/// A lexical block
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    /// Anonymous function whose body contains the block (`None` for the method itself)
    pub function: Option<FnId>,
    /// Variables declared here, parameters first
    pub declared: Vec<Var>,
}

/// What an anonymous function needs from its surroundings
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub id: FnId,
    /// Enclosing anonymous function (`None` when directly in the method)
    pub parent: Option<FnId>,
    /// Block the function expression appears in
    pub enclosing_scope: ScopeId,
    pub body_scope: ScopeId,
    pub captures_self: bool,
    /// Captures at least one local or parameter of an enclosing function
    pub captures_locals: bool,
}

/// Result of analyzing one method body
#[derive(Debug, Clone, Default)]
pub struct CaptureInfo {
    pub root_scope: ScopeId,
    pub scopes: Vec<ScopeInfo>,
    pub functions: Vec<FunctionInfo>,
    /// Declaring scope of each variable
    pub home: HashMap<Var, ScopeId>,
    captured: HashSet<Var>,
    pub yield_count: usize,
}

impl CaptureInfo {
    pub fn is_captured(&self, var: Var) -> bool {
        self.captured.contains(&var)
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id.0 as usize]
    }

    pub fn function(&self, id: FnId) -> &FunctionInfo {
        &self.functions[id.0 as usize]
    }

    /// Captured variables declared in `scope`, in declaration order. The
    /// receiver is never listed.
    pub fn captured_in(&self, scope: ScopeId) -> Vec<Var> {
        self.scope(scope)
            .declared
            .iter()
            .copied()
            .filter(|v| *v != Var::This && self.is_captured(*v))
            .collect()
    }

    /// Functions whose nearest enclosing function is `parent`.
    pub fn children_of(&self, parent: Option<FnId>) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.iter().filter(move |f| f.parent == parent)
    }

    pub fn has_functions(&self) -> bool {
        !self.functions.is_empty()
    }

    pub fn has_yield(&self) -> bool {
        self.yield_count > 0
    }
}

/// Number the scopes and functions of `body` and compute capture information.
pub fn analyze(module: &Module, method: MethodId, body: &mut Block) -> Result<CaptureInfo> {
    let m = module.method(method);
    let mut root_vars: Vec<Var> = m.params.iter().map(|p| Var::Param(*p)).collect();
    if !m.is_static {
        root_vars.push(Var::This);
    }

    let mut analyzer = Analyzer {
        module,
        method,
        is_instance: !m.is_static,
        info: CaptureInfo::default(),
        scope_stack: Vec::new(),
        frames: Vec::new(),
        pending: root_vars,
        error: None,
    };
    analyzer.visit_block_mut(body);
    if let Some(err) = analyzer.error {
        return Err(err);
    }
    Ok(analyzer.info)
}

struct Frame {
    id: FnId,
    /// Variables visible where the function appears
    candidates: HashSet<Var>,
}

struct Analyzer<'a> {
    module: &'a Module,
    method: MethodId,
    is_instance: bool,
    info: CaptureInfo,
    scope_stack: Vec<ScopeId>,
    frames: Vec<Frame>,
    /// Parameters to declare in the next block entered
    pending: Vec<Var>,
    error: Option<LowerError>,
}

impl Analyzer<'_> {
    fn current_function(&self) -> Option<FnId> {
        self.frames.last().map(|f| f.id)
    }

    fn declare(&mut self, var: Var) {
        if let Some(scope) = self.scope_stack.last().copied() {
            self.info.scopes[scope.0 as usize].declared.push(var);
            self.info.home.insert(var, scope);
        }
    }

    /// Every variable declared in an open scope.
    fn visible(&self) -> HashSet<Var> {
        self.scope_stack
            .iter()
            .flat_map(|s| self.info.scopes[s.0 as usize].declared.iter().copied())
            .collect()
    }

    fn fail(&mut self, err: LowerError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn reference(&mut self, var: Var) {
        if self.frames.is_empty() {
            return;
        }
        let home_function = self
            .info
            .home
            .get(&var)
            .map(|scope| self.info.scopes[scope.0 as usize].function);
        if home_function == Some(self.current_function()) {
            return;
        }

        let mut marked = false;
        for frame in self.frames.iter().rev() {
            if !frame.candidates.contains(&var) {
                break;
            }
            let function = &mut self.info.functions[frame.id.0 as usize];
            match var {
                Var::This => function.captures_self = true,
                _ => function.captures_locals = true,
            }
            marked = true;
        }

        if marked {
            if self.info.captured.insert(var) {
                trace!("captured `{}`", var.describe(self.module));
            }
        } else {
            self.fail(LowerError::UnboundVariable {
                method: qualified_name(self.module, self.method),
                variable: var.describe(self.module),
            });
        }
    }
}

impl VisitMut for Analyzer<'_> {
    fn visit_block_mut(&mut self, block: &mut Block) {
        let id = ScopeId(self.info.scopes.len() as u32);
        block.scope = id;
        if self.scope_stack.is_empty() {
            self.info.root_scope = id;
        }
        self.info.scopes.push(ScopeInfo {
            id,
            parent: self.scope_stack.last().copied(),
            function: self.current_function(),
            declared: Vec::new(),
        });
        self.scope_stack.push(id);
        for var in std::mem::take(&mut self.pending) {
            self.declare(var);
        }
        for stmt in &mut block.stmts {
            self.visit_stmt_mut(stmt);
        }
        self.scope_stack.pop();
    }

    fn visit_stmt_mut(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Local { local, .. } => self.declare(Var::Local(*local)),
            Stmt::YieldReturn(_) | Stmt::YieldBreak => {
                if !self.frames.is_empty() {
                    self.fail(LowerError::YieldInsideAnonymousFunction {
                        method: qualified_name(self.module, self.method),
                    });
                }
                self.info.yield_count += 1;
            }
            _ => {}
        }
        walk_stmt_mut(self, stmt);
    }

    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Local(id) => self.reference(Var::Local(*id)),
            Expr::Param(id) => self.reference(Var::Param(*id)),
            Expr::This => {
                if self.is_instance {
                    self.reference(Var::This);
                } else {
                    self.fail(LowerError::UnboundVariable {
                        method: qualified_name(self.module, self.method),
                        variable: "this".to_string(),
                    });
                }
            }
            _ => {}
        }
        walk_expr_mut(self, expr);
    }

    fn visit_lambda_mut(&mut self, lambda: &mut AnonymousFunction) {
        let id = FnId(self.info.functions.len() as u32);
        lambda.id = id;

        let mut candidates = self.visible();
        if self.is_instance {
            candidates.insert(Var::This);
        }
        self.info.functions.push(FunctionInfo {
            id,
            parent: self.current_function(),
            enclosing_scope: self.scope_stack.last().copied().unwrap_or_default(),
            body_scope: ScopeId(self.info.scopes.len() as u32),
            captures_self: false,
            captures_locals: false,
        });
        self.frames.push(Frame { id, candidates });
        self.pending = lambda.params.iter().map(|p| Var::Param(*p)).collect();
        self.visit_block_mut(&mut lambda.body);
        self.frames.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_ir::builder::{assign, block, decl, expr, local, param, ret};

    fn instance_method(module: &mut Module) -> MethodId {
        let class = module.add_class("C");
        let void = module.types.void();
        module.add_method(class, "M", void, false)
    }

    fn take_body(module: &mut Module, method: MethodId) -> Block {
        module.method_mut(method).body.take().unwrap()
    }

    #[test]
    fn test_lambda_without_free_variables_captures_nothing() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let x = module.add_param("x", int);
        let f = module.lambda(vec![x], int, vec![ret(Some(param(x)))]);
        module.set_body(method, vec![expr(f)]);

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        let f = info.function(FnId(0));
        assert!(!f.captures_self);
        assert!(!f.captures_locals);
        assert!(!info.is_captured(Var::Param(x)));
    }

    #[test]
    fn test_nested_capture_marks_every_crossed_function() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let k = module.add_local("k", int);
        let y = module.add_param("y", int);
        let inner = module.lambda(vec![y], int, vec![ret(Some(local(k)))]);
        let outer = module.lambda(vec![], int, vec![expr(inner)]);
        module.set_body(method, vec![decl(k, None), expr(outer)]);

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        assert!(info.is_captured(Var::Local(k)));
        assert!(info.function(FnId(0)).captures_locals);
        assert!(info.function(FnId(1)).captures_locals);
        assert_eq!(info.function(FnId(1)).parent, Some(FnId(0)));
        assert_eq!(info.captured_in(info.root_scope), vec![Var::Local(k)]);
    }

    #[test]
    fn test_capture_stops_at_declaring_function() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let x = module.add_param("x", int);
        let inner = module.lambda(vec![], int, vec![ret(Some(param(x)))]);
        let outer = module.lambda(vec![x], int, vec![expr(inner)]);
        module.set_body(method, vec![expr(outer)]);

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        assert!(!info.function(FnId(0)).captures_locals);
        assert!(info.function(FnId(1)).captures_locals);
        let home = info.home[&Var::Param(x)];
        assert_eq!(info.scope(home).function, Some(FnId(0)));
    }

    #[test]
    fn test_self_capture_propagates_outward() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let void = module.types.void();
        let inner = module.lambda(vec![], void, vec![expr(Expr::This)]);
        let outer = module.lambda(vec![], void, vec![expr(inner)]);
        module.set_body(method, vec![expr(outer)]);

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        assert!(info.function(FnId(0)).captures_self);
        assert!(info.function(FnId(1)).captures_self);
        assert!(!info.function(FnId(0)).captures_locals);
    }

    #[test]
    fn test_scopes_are_numbered_in_order() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let a = module.add_local("a", int);
        let b = module.add_local("b", int);
        let one = module.int(1);
        module.set_body(
            method,
            vec![decl(a, Some(one)), block(vec![decl(b, Some(local(a)))])],
        );

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        assert_eq!(info.scopes.len(), 2);
        assert_eq!(info.scope(ScopeId(1)).parent, Some(ScopeId(0)));
        assert_eq!(info.home[&Var::Local(b)], ScopeId(1));
        match &body.stmts[1] {
            Stmt::Block(inner) => assert_eq!(inner.scope, ScopeId(1)),
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_capture_is_rejected() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let ghost = module.add_local("ghost", int);
        let one = module.int(1);
        let f = module.lambda(vec![], int, vec![expr(assign(local(ghost), one))]);
        module.set_body(method, vec![expr(f)]);

        let mut body = take_body(&mut module, method);
        let err = analyze(&module, method, &mut body).unwrap_err();
        assert!(matches!(err, LowerError::UnboundVariable { variable, .. } if variable == "ghost"));
    }

    #[test]
    fn test_yield_inside_lambda_is_rejected() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let void = module.types.void();
        let f = module.lambda(vec![], void, vec![Stmt::YieldBreak]);
        module.set_body(method, vec![expr(f), Stmt::YieldBreak]);

        let mut body = take_body(&mut module, method);
        let err = analyze(&module, method, &mut body).unwrap_err();
        assert!(matches!(err, LowerError::YieldInsideAnonymousFunction { .. }));
    }

    #[test]
    fn test_sibling_functions_do_not_share_variables() {
        let mut module = Module::new("test");
        let method = instance_method(&mut module);
        let int = module.types.int32();
        let x = module.add_param("x", int);
        let shadow = module.add_param("x", int);
        let k = module.add_local("k", int);
        let one = module.int(1);
        let first = module.lambda(vec![x], int, vec![ret(Some(param(x)))]);
        let inner = module.lambda(vec![shadow], int, vec![ret(Some(local(k)))]);
        let second = module.lambda(vec![], int, vec![expr(inner)]);
        module.set_body(
            method,
            vec![expr(first), decl(k, Some(one)), expr(second)],
        );

        let mut body = take_body(&mut module, method);
        let info = analyze(&module, method, &mut body).unwrap();
        let first = info.function(FnId(0));
        assert!(!first.captures_locals);
        assert!(!first.captures_self);
        assert!(!info.is_captured(Var::Param(x)));
        assert!(!info.is_captured(Var::Param(shadow)));
        assert_eq!(info.captured_in(info.root_scope), vec![Var::Local(k)]);
        assert!(info.function(FnId(1)).captures_locals);
        assert!(info.function(FnId(2)).captures_locals);
        assert_eq!(info.function(FnId(2)).parent, Some(FnId(1)));
        let home = info.home[&Var::Param(shadow)];
        assert_eq!(info.scope(home).function, Some(FnId(2)));
    }
}
