//! Anonymous function lowering
//!
//! Every anonymous function becomes a real method and its expression becomes a
//! delegate construction bound to that method:
//!
//! - nothing captured: a static method on the containing type
//! - only the receiver captured: an instance method on the containing type
//! - locals or parameters captured: an instance method on the closure of the
//!   innermost scope enclosing the function
//!
//! Captured variables are rewritten everywhere, including in their declaring
//! function, into field accesses on closure instances.

use std::collections::HashMap;

use cinder_ir::builder::assign;
use cinder_ir::{
    AnonymousFunction, BinaryOp, Block, Constant, Expr, FieldRef, FnId, MethodRef, Module, Stmt,
    Visibility,
};
use cinder_types::{FieldId, LocalId, MethodId, TypeDefId, TypeId};
use log::{debug, trace};

use crate::capture::{CaptureInfo, FunctionInfo, Var};
use crate::closure::ClosureSynthesizer;
use crate::error::{LowerError, Result};
use crate::options::LowerOptions;
use crate::subst::{qualified_name, Substitution};

/// A member added to the containing type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Method(MethodId),
    Field(FieldId),
}

/// What closure conversion added to the module
#[derive(Debug, Clone, Default)]
pub struct ClosureConversion {
    /// Closure types, in creation order
    pub closure_types: Vec<TypeDefId>,
    /// Peer methods and delegate caches added to the containing type
    pub peer_members: Vec<Member>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    StaticPeer,
    InstancePeer,
    Closure,
}

fn strategy(function: &FunctionInfo) -> Strategy {
    if function.captures_locals {
        Strategy::Closure
    } else if function.captures_self {
        Strategy::InstancePeer
    } else {
        Strategy::StaticPeer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Method,
    StaticPeer,
    InstancePeer,
    ClosureMethod,
}

/// Code of one emitted method: the original method or a lowered function
struct Frame {
    kind: FrameKind,
    function: Option<FnId>,
    /// Closure instance the method runs on
    receiver: Option<usize>,
    /// From the original method's types into this method's
    subst: Substitution,
    /// Closures allocated in this method so far, with the locals holding them
    scopes: Vec<(usize, LocalId)>,
    is_constructor: bool,
}

impl Frame {
    /// Whether the real receiver is available as `this`.
    fn self_direct(&self) -> bool {
        matches!(self.kind, FrameKind::Method | FrameKind::InstancePeer)
    }

    /// Closure that functions at the current position are placed on.
    fn innermost(&self) -> Option<usize> {
        self.scopes.last().map(|(record, _)| *record).or(self.receiver)
    }
}

/// Replace every anonymous function in `body` with a delegate to a synthesized method.
pub fn lower_anonymous_functions(
    module: &mut Module,
    method: MethodId,
    body: &mut Block,
    info: &CaptureInfo,
    options: &LowerOptions,
) -> Result<ClosureConversion> {
    let original_types = info
        .home
        .keys()
        .filter_map(|var| match *var {
            Var::Local(id) => Some((*var, module.local(id).ty)),
            Var::Param(id) => Some((*var, module.param(id).ty)),
            Var::This => None,
        })
        .collect();

    let m = module.method(method);
    let is_constructor = m.is_constructor;
    let containing = m.owner;
    let method_name = m.name.clone();
    let closures = ClosureSynthesizer::new(module, method);
    let subst = Substitution::identity(module, method);
    let this_type = module.self_type(containing);

    let mut lowering = Lowering {
        module,
        info,
        options,
        method,
        containing,
        method_name,
        closures,
        bindings: HashMap::new(),
        original_types,
        this_type,
        peer_count: 0,
        peer_members: Vec::new(),
    };
    let mut frame = Frame {
        kind: FrameKind::Method,
        function: None,
        receiver: None,
        subst,
        scopes: Vec::new(),
        is_constructor,
    };
    lowering.lower_block(&mut frame, body, true)?;

    Ok(ClosureConversion {
        peer_members: lowering.peer_members,
        closure_types: lowering.closures.into_types(),
    })
}

struct Lowering<'a> {
    module: &'a mut Module,
    info: &'a CaptureInfo,
    options: &'a LowerOptions,
    method: MethodId,
    containing: TypeDefId,
    method_name: String,
    closures: ClosureSynthesizer,
    /// Closure record and field holding each captured variable
    bindings: HashMap<Var, (usize, FieldId)>,
    original_types: HashMap<Var, TypeId>,
    this_type: TypeId,
    peer_count: u32,
    peer_members: Vec<Member>,
}

impl Lowering<'_> {
    fn missing(&self, what: impl Into<String>) -> LowerError {
        LowerError::MissingClosure {
            method: qualified_name(self.module, self.method),
            what: what.into(),
        }
    }

    fn original_type(&self, var: Var) -> TypeId {
        match var {
            Var::Local(id) => self
                .original_types
                .get(&var)
                .copied()
                .unwrap_or_else(|| self.module.local(id).ty),
            Var::Param(id) => self
                .original_types
                .get(&var)
                .copied()
                .unwrap_or_else(|| self.module.param(id).ty),
            Var::This => self.this_type,
        }
    }

    fn var_name(&self, var: Var) -> String {
        var.describe(self.module)
    }

    /// A frame's root closure holds the receiver when one of the frame's own
    /// functions is lowered onto a closure and uses `this`.
    fn needs_self_field(&self, frame: &Frame) -> bool {
        frame.self_direct()
            && self
                .info
                .children_of(frame.function)
                .any(|f| strategy(f) == Strategy::Closure && f.captures_self)
    }

    fn closure_type(&mut self, frame: &Frame, record: usize) -> TypeId {
        self.closures
            .closure_type(self.module, record, frame.subst.targets())
    }

    /// Expression evaluating to the instance of `record` from inside `frame`.
    fn instance_path(&mut self, frame: &Frame, record: usize) -> Result<Expr> {
        if let Some((_, local)) = frame.scopes.iter().rev().find(|(r, _)| *r == record) {
            return Ok(Expr::Local(*local));
        }
        let mut current = frame
            .receiver
            .ok_or_else(|| self.missing(format!("closure #{}", record)))?;
        let mut path = Expr::This;
        while current != record {
            let rec = self.closures.chain().get(current);
            let (Some(outer), Some(parent)) = (rec.outer_field, rec.parent) else {
                return Err(self.missing(format!("closure #{}", record)));
            };
            let owner = self.closure_type(frame, current);
            path = Expr::Field {
                target: Some(Box::new(path)),
                field: FieldRef {
                    field: outer,
                    owner,
                },
            };
            current = parent;
        }
        Ok(path)
    }

    /// Expression evaluating to the original receiver from inside `frame`.
    fn self_path(&mut self, frame: &Frame) -> Result<Expr> {
        if frame.self_direct() {
            return Ok(Expr::This);
        }
        let mut current = frame.receiver.ok_or_else(|| self.missing("this"))?;
        let mut path = Expr::This;
        loop {
            let rec = self.closures.chain().get(current);
            let (self_field, outer, parent) = (rec.self_field, rec.outer_field, rec.parent);
            let owner = self.closure_type(frame, current);
            if let Some(field) = self_field {
                return Ok(Expr::Field {
                    target: Some(Box::new(path)),
                    field: FieldRef { field, owner },
                });
            }
            let (Some(outer), Some(parent)) = (outer, parent) else {
                return Err(self.missing("this"));
            };
            path = Expr::Field {
                target: Some(Box::new(path)),
                field: FieldRef {
                    field: outer,
                    owner,
                },
            };
            current = parent;
        }
    }

    fn field_access(&mut self, frame: &Frame, record: usize, field: FieldId) -> Result<Expr> {
        let target = self.instance_path(frame, record)?;
        let owner = self.closure_type(frame, record);
        Ok(Expr::Field {
            target: Some(Box::new(target)),
            field: FieldRef { field, owner },
        })
    }

    fn lower_block(&mut self, frame: &mut Frame, block: &mut Block, is_root: bool) -> Result<()> {
        let captured = self.info.captured_in(block.scope);
        let wants_self = is_root && self.needs_self_field(frame);
        if captured.is_empty() && !wants_self {
            return self.lower_stmts(frame, &mut block.stmts);
        }

        let parent = frame.innermost();
        let parent_path = match parent {
            Some(p) => Some(self.instance_path(frame, p)?),
            None => None,
        };
        let record = self.closures.create(self.module, block.scope, parent)?;
        for var in &captured {
            let name = self.var_name(*var);
            let ty = self.original_type(*var);
            let field = self.closures.add_capture(self.module, record, &name, ty)?;
            trace!("`{}` lives in closure #{}", name, record);
            self.bindings.insert(*var, (record, field));
        }
        let self_field = wants_self.then(|| self.closures.add_self_field(self.module, record));

        let closure_ty = self.closure_type(frame, record);
        let local_name = self.closures.chain().get(record).local_name.clone();
        let local = self.module.add_local(local_name, closure_ty);

        let rec = self.closures.chain().get(record);
        let (ctor, outer_field) = (rec.ctor, rec.outer_field);
        let mut prologue = vec![Stmt::Local {
            local,
            init: Some(Expr::New {
                ctor: MethodRef {
                    method: ctor,
                    owner: closure_ty,
                    type_args: Vec::new(),
                },
                args: Vec::new(),
            }),
        }];
        if let (Some(outer), Some(path)) = (outer_field, parent_path) {
            let target = field_of(Expr::Local(local), outer, closure_ty);
            prologue.push(Stmt::Expr(assign(target, path)));
        }
        for var in &captured {
            if let Var::Param(p) = var {
                let (_, field) = self.bindings[var];
                let target = field_of(Expr::Local(local), field, closure_ty);
                prologue.push(Stmt::Expr(assign(target, Expr::Param(*p))));
            }
        }
        let self_copy = match self_field {
            Some(field) => {
                let value = self.self_path(frame)?;
                Some(Stmt::Expr(assign(
                    field_of(Expr::Local(local), field, closure_ty),
                    value,
                )))
            }
            None => None,
        };

        frame.scopes.push((record, local));
        let lowered = self.lower_stmts(frame, &mut block.stmts);
        frame.scopes.pop();
        lowered?;

        let rest = std::mem::take(&mut block.stmts);
        let split = if is_root && frame.is_constructor {
            self.constructor_call_end(&rest)
        } else {
            0
        };
        let mut rest = rest.into_iter();
        let mut stmts = prologue;
        stmts.extend(rest.by_ref().take(split));
        stmts.extend(self_copy);
        stmts.extend(rest);
        block.stmts = stmts;
        Ok(())
    }

    /// Position just past the leading base or chained constructor call.
    fn constructor_call_end(&self, stmts: &[Stmt]) -> usize {
        stmts
            .iter()
            .position(|stmt| match stmt {
                Stmt::Expr(Expr::Call {
                    method,
                    receiver: Some(receiver),
                    ..
                }) => {
                    matches!(**receiver, Expr::This)
                        && self.module.method(method.method).is_constructor
                }
                _ => false,
            })
            .map_or(0, |i| i + 1)
    }

    fn lower_stmts(&mut self, frame: &mut Frame, stmts: &mut [Stmt]) -> Result<()> {
        for stmt in stmts {
            self.lower_stmt(frame, stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, frame: &mut Frame, stmt: &mut Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(block) => self.lower_block(frame, block, false)?,
            Stmt::Local { local, init } => {
                let var = Var::Local(*local);
                if let Some(init) = init.as_mut() {
                    self.lower_expr(frame, init)?;
                }
                match self.bindings.get(&var).copied() {
                    Some((record, field)) => {
                        let value = init.take();
                        let target = self.field_access(frame, record, field)?;
                        *stmt = match value {
                            Some(value) => Stmt::Expr(assign(target, value)),
                            None => Stmt::Empty,
                        };
                    }
                    None if !frame.subst.is_identity() => {
                        let id = *local;
                        let original = self.original_type(var);
                        let ty = frame.subst.apply(&mut self.module.types, original)?;
                        self.module.local_mut(id).ty = ty;
                    }
                    None => {}
                }
            }
            Stmt::Expr(expr) | Stmt::YieldReturn(expr) | Stmt::Return(Some(expr)) => {
                self.lower_expr(frame, expr)?
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                self.lower_expr(frame, cond)?;
                self.lower_block(frame, then_block, false)?;
                if let Some(else_block) = else_block {
                    self.lower_block(frame, else_block, false)?;
                }
            }
            Stmt::While { cond, body } => {
                self.lower_expr(frame, cond)?;
                self.lower_block(frame, body, false)?;
            }
            Stmt::Switch {
                value,
                cases,
                default,
            } => {
                self.lower_expr(frame, value)?;
                for case in cases {
                    self.lower_stmts(frame, &mut case.body)?;
                }
                if let Some(default) = default {
                    self.lower_stmts(frame, default)?;
                }
            }
            Stmt::Return(None)
            | Stmt::Label(_)
            | Stmt::Goto(_)
            | Stmt::YieldBreak
            | Stmt::Empty => {}
        }
        Ok(())
    }

    fn lower_expr(&mut self, frame: &mut Frame, expr: &mut Expr) -> Result<()> {
        match expr {
            Expr::Local(id) => {
                if let Some((record, field)) = self.bindings.get(&Var::Local(*id)).copied() {
                    *expr = self.field_access(frame, record, field)?;
                }
                return Ok(());
            }
            Expr::Param(id) => {
                if let Some((record, field)) = self.bindings.get(&Var::Param(*id)).copied() {
                    *expr = self.field_access(frame, record, field)?;
                }
                return Ok(());
            }
            Expr::This => {
                if !frame.self_direct() {
                    *expr = self.self_path(frame)?;
                }
                return Ok(());
            }
            Expr::Lambda(_) => {
                let Expr::Lambda(function) = std::mem::replace(expr, Expr::This) else {
                    return Ok(());
                };
                *expr = self.lower_function(frame, *function)?;
                return Ok(());
            }
            _ => {}
        }

        frame.subst.apply_to_node(&mut self.module.types, expr)?;
        match expr {
            Expr::Field { target, .. } => {
                if let Some(target) = target {
                    self.lower_expr(frame, target)?;
                }
            }
            Expr::Assign { target, value } => {
                self.lower_expr(frame, target)?;
                self.lower_expr(frame, value)?;
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.lower_expr(frame, lhs)?;
                self.lower_expr(frame, rhs)?;
            }
            Expr::Not(inner) | Expr::Convert { value: inner, .. } => {
                self.lower_expr(frame, inner)?
            }
            Expr::Call { receiver, args, .. } => {
                if let Some(receiver) = receiver {
                    self.lower_expr(frame, receiver)?;
                }
                for arg in args {
                    self.lower_expr(frame, arg)?;
                }
            }
            Expr::New { args, .. } => {
                for arg in args {
                    self.lower_expr(frame, arg)?;
                }
            }
            Expr::Invoke { delegate, args } => {
                self.lower_expr(frame, delegate)?;
                for arg in args {
                    self.lower_expr(frame, arg)?;
                }
            }
            Expr::CreateDelegate { receiver, .. } => {
                if let Some(receiver) = receiver {
                    self.lower_expr(frame, receiver)?;
                }
            }
            Expr::Sequence { stmts, value } => {
                self.lower_stmts(frame, stmts)?;
                self.lower_expr(frame, value)?;
            }
            Expr::Const { .. }
            | Expr::Local(_)
            | Expr::Param(_)
            | Expr::This
            | Expr::Lambda(_) => {}
        }
        Ok(())
    }

    /// Emit the method for `function` and build the delegate construction replacing it.
    fn lower_function(&mut self, frame: &mut Frame, function: AnonymousFunction) -> Result<Expr> {
        let info = self.info.function(function.id).clone();
        let delegate_ty = frame
            .subst
            .apply(&mut self.module.types, function.delegate_type)?;

        match strategy(&info) {
            Strategy::StaticPeer | Strategy::InstancePeer => {
                let is_static = strategy(&info) == Strategy::StaticPeer;
                let (peer, subst) = self.create_peer(is_static)?;
                self.define_signature(peer, &function, &subst)?;
                let mut inner = Frame {
                    kind: if is_static {
                        FrameKind::StaticPeer
                    } else {
                        FrameKind::InstancePeer
                    },
                    function: Some(function.id),
                    receiver: None,
                    subst,
                    scopes: Vec::new(),
                    is_constructor: false,
                };
                let mut body = function.body;
                self.lower_block(&mut inner, &mut body, true)?;
                self.module.method_mut(peer).body = Some(body);

                let type_args = if self.module.method(peer).generic_params.is_empty() {
                    Vec::new()
                } else {
                    frame.subst.targets().to_vec()
                };
                let cacheable = is_static && type_args.is_empty();
                let owner = self.module.self_type(self.containing);
                let receiver = if is_static {
                    None
                } else {
                    Some(Box::new(self.self_path(frame)?))
                };
                let create = Expr::CreateDelegate {
                    method: MethodRef {
                        method: peer,
                        owner,
                        type_args,
                    },
                    receiver,
                    ty: delegate_ty,
                };
                if cacheable && self.options.cache_static_delegates {
                    Ok(self.cache_delegate(create, delegate_ty))
                } else {
                    Ok(create)
                }
            }
            Strategy::Closure => {
                let record = frame
                    .innermost()
                    .ok_or_else(|| self.missing("an anonymous function's captures"))?;
                let void = self.module.types.void();
                let method = self.closures.add_method(self.module, record, void);
                let subst = match self.closures.inside(record) {
                    Some(subst) => subst.clone(),
                    None => Substitution::new(self.module, self.method, Vec::new()),
                };
                self.define_signature(method, &function, &subst)?;
                let mut inner = Frame {
                    kind: FrameKind::ClosureMethod,
                    function: Some(function.id),
                    receiver: Some(record),
                    subst,
                    scopes: Vec::new(),
                    is_constructor: false,
                };
                let mut body = function.body;
                self.lower_block(&mut inner, &mut body, true)?;
                self.module.method_mut(method).body = Some(body);

                let owner = self.closure_type(frame, record);
                let receiver = self.instance_path(frame, record)?;
                Ok(Expr::CreateDelegate {
                    method: MethodRef {
                        method,
                        owner,
                        type_args: Vec::new(),
                    },
                    receiver: Some(Box::new(receiver)),
                    ty: delegate_ty,
                })
            }
        }
    }

    /// Add a peer method to the containing type, generic over copies of the
    /// method's type parameters when the method is generic.
    fn create_peer(&mut self, is_static: bool) -> Result<(MethodId, Substitution)> {
        self.peer_count += 1;
        let name = format!("<{}>p__{}", self.method_name, self.peer_count);
        let void = self.module.types.void();
        let peer = self.module.add_method(self.containing, name, void, is_static);
        {
            let m = self.module.method_mut(peer);
            m.visibility = Visibility::Private;
            m.compiler_generated = true;
        }
        let subst = Substitution::onto_method(self.module, self.method, peer);
        let params = subst.duplicate_params(self.module, |p| p.name.clone())?;
        self.module.method_mut(peer).generic_params = params;
        self.peer_members.push(Member::Method(peer));
        debug!(
            "{} peer method {}",
            if is_static { "static" } else { "instance" },
            self.module.method(peer).name
        );
        Ok((peer, subst))
    }

    /// Give `method` the function's parameters and return type, in the method's own types.
    fn define_signature(
        &mut self,
        method: MethodId,
        function: &AnonymousFunction,
        subst: &Substitution,
    ) -> Result<()> {
        let return_type = subst.apply(&mut self.module.types, function.return_type)?;
        for param in &function.params {
            let ty = self.original_type(Var::Param(*param));
            let ty = subst.apply(&mut self.module.types, ty)?;
            self.module.param_mut(*param).ty = ty;
        }
        let m = self.module.method_mut(method);
        m.return_type = return_type;
        m.params = function.params.clone();
        Ok(())
    }

    /// `(cache == null ? cache = create : cache)` through a static field.
    fn cache_delegate(&mut self, create: Expr, delegate_ty: TypeId) -> Expr {
        let name = format!("CS$<>__CachedAnonymousMethodDelegate{}", self.peer_count);
        let field = self.module.add_field(self.containing, name, delegate_ty);
        {
            let f = &mut self.module.fields[field.index()];
            f.is_static = true;
            f.visibility = Visibility::Private;
            f.compiler_generated = true;
        }
        self.peer_members.push(Member::Field(field));

        let owner = self.module.self_type(self.containing);
        let cache = Expr::Field {
            target: None,
            field: FieldRef { field, owner },
        };
        let null = Expr::Const {
            value: Constant::Null,
            ty: delegate_ty,
        };
        let is_empty = Expr::Binary {
            op: BinaryOp::Eq,
            lhs: Box::new(cache.clone()),
            rhs: Box::new(null),
        };
        Expr::Sequence {
            stmts: vec![Stmt::If {
                cond: is_empty,
                then_block: Block::new(vec![Stmt::Expr(assign(cache.clone(), create))]),
                else_block: None,
            }],
            value: Box::new(cache),
        }
    }
}

fn field_of(target: Expr, field: FieldId, owner: TypeId) -> Expr {
    Expr::Field {
        target: Some(Box::new(target)),
        field: FieldRef { field, owner },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_method;
    use cinder_ir::builder::{binary, decl, expr, invoke, local, param, ret};
    use cinder_ir::visit::{walk_expr, Visit};
    use cinder_ir::{print_method, Method};
    use cinder_types::TypeKind;

    fn delegate_of(lambda: &Expr) -> TypeId {
        match lambda {
            Expr::Lambda(f) => f.delegate_type,
            other => panic!("expected a lambda, got {:?}", other),
        }
    }

    #[derive(Default)]
    struct Uses {
        lambdas: usize,
        locals: Vec<LocalId>,
    }

    impl Visit for Uses {
        fn visit_expr(&mut self, expr: &Expr) {
            match expr {
                Expr::Lambda(_) => self.lambdas += 1,
                Expr::Local(id) => self.locals.push(*id),
                _ => {}
            }
            walk_expr(self, expr);
        }
    }

    fn uses(method: &Method) -> Uses {
        let mut uses = Uses::default();
        uses.visit_block(method.body.as_ref().unwrap());
        uses
    }

    fn setup(is_static: bool) -> (Module, TypeDefId, MethodId) {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let void = module.types.void();
        let method = module.add_method(class, "M", void, is_static);
        (module, class, method)
    }

    fn lower(module: &mut Module, method: MethodId) -> crate::NormalizedMethod {
        normalize_method(module, method, &LowerOptions::default()).unwrap()
    }

    fn method_named(module: &Module, owner: TypeDefId, name: &str) -> MethodId {
        module
            .find_method(owner, name)
            .unwrap_or_else(|| panic!("no method {} on {}", name, module.type_def(owner).name))
    }

    fn field_names(module: &Module, def: TypeDefId) -> Vec<String> {
        module
            .type_def(def)
            .fields
            .iter()
            .map(|f| module.field(*f).name.clone())
            .collect()
    }

    #[test]
    fn test_function_without_captures_becomes_static_peer() {
        let (mut module, class, method) = setup(false);
        let int = module.types.int32();
        let x = module.add_param("x", int);
        let one = module.int(1);
        let f = module.lambda(vec![x], int, vec![ret(Some(binary(BinaryOp::Add, param(x), one)))]);
        let delegate = delegate_of(&f);
        let d = module.add_local("d", delegate);
        module.set_body(method, vec![decl(d, Some(f))]);

        let result = lower(&mut module, method);

        assert!(result.closure_types.is_empty());
        let [Member::Method(peer)] = result.peer_members[..] else {
            panic!("expected one peer method, got {:?}", result.peer_members);
        };
        let m = module.method(peer);
        assert!(m.is_static);
        assert_eq!(m.name, "<M>p__1");
        assert_eq!(m.owner, class);
        assert_eq!(m.params, vec![x]);
        assert_eq!(m.return_type, int);
        match &module.method(method).body.as_ref().unwrap().stmts[0] {
            Stmt::Local {
                init:
                    Some(Expr::CreateDelegate {
                        method: target,
                        receiver: None,
                        ty,
                    }),
                ..
            } => {
                assert_eq!(target.method, peer);
                assert_eq!(*ty, delegate);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_function_using_only_this_becomes_instance_peer() {
        let (mut module, class, method) = setup(false);
        let int = module.types.int32();
        let counter = module.add_field(class, "counter", int);
        let one = module.int(1);
        let target = module.field_of(Expr::This, counter);
        let void = module.types.void();
        let f = module.lambda(vec![], void, vec![expr(assign(target, one))]);
        module.set_body(method, vec![expr(invoke(f, vec![]))]);

        let result = lower(&mut module, method);

        assert!(result.closure_types.is_empty());
        let [Member::Method(peer)] = result.peer_members[..] else {
            panic!("expected one peer method");
        };
        assert!(!module.method(peer).is_static);
        assert!(print_method(&module, peer).contains("this.counter = 1;"));
        match &module.method(method).body.as_ref().unwrap().stmts[0] {
            Stmt::Expr(Expr::Invoke { delegate, .. }) => match &**delegate {
                Expr::CreateDelegate { receiver, .. } => {
                    assert_eq!(receiver.as_deref(), Some(&Expr::This))
                }
                other => panic!("unexpected delegate {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_captured_local_moves_into_closure() {
        let (mut module, class, method) = setup(false);
        let int = module.types.int32();
        let total = module.add_local("total", int);
        let zero = module.int(0);
        let one = module.int(1);
        let void = module.types.void();
        let increment = assign(local(total), binary(BinaryOp::Add, local(total), one));
        let f = module.lambda(vec![], void, vec![expr(increment)]);
        let d = module.add_local("d", delegate_of(&f));
        module.set_body(
            method,
            vec![
                decl(total, Some(zero)),
                decl(d, Some(f)),
                expr(invoke(local(d), vec![])),
            ],
        );

        let result = lower(&mut module, method);

        let [closure] = result.closure_types[..] else {
            panic!("expected one closure type");
        };
        assert_eq!(module.type_def(closure).name, "<M>c__DisplayClass1");
        assert_eq!(module.type_def(closure).declaring, Some(class));
        assert_eq!(field_names(&module, closure), vec!["total"]);

        let text = print_method(&module, method);
        assert!(text.contains("<M>c__DisplayClass1 CS$<>8__locals1 = new <M>c__DisplayClass1();"));
        assert!(text.contains("CS$<>8__locals1.total = 0;"));
        assert!(text.contains("(CS$<>8__locals1.<M>b__1)"));

        let lowered = method_named(&module, closure, "<M>b__1");
        assert!(print_method(&module, lowered).contains("this.total = this.total + 1;"));

        // Nothing refers to the captured local any more
        for m in [method, lowered] {
            let uses = uses(module.method(m));
            assert_eq!(uses.lambdas, 0);
            assert!(!uses.locals.contains(&total));
        }
        assert_eq!(module.validate(), Ok(()));
    }

    #[test]
    fn test_nested_functions_chain_closures() {
        let (mut module, _, method) = setup(true);
        let int = module.types.int32();
        let k = module.add_local("k", int);
        let x = module.add_param("x", int);
        let one = module.int(1);
        let inner = module.lambda(
            vec![],
            int,
            vec![ret(Some(binary(BinaryOp::Add, param(x), local(k))))],
        );
        let inner_delegate = delegate_of(&inner);
        let outer = module.lambda(vec![x], inner_delegate, vec![ret(Some(inner))]);
        let f = module.add_local("f", delegate_of(&outer));
        module.set_body(method, vec![decl(k, Some(one)), decl(f, Some(outer))]);

        let result = lower(&mut module, method);

        let [first, second] = result.closure_types[..] else {
            panic!("expected two closure types");
        };
        assert_eq!(field_names(&module, first), vec!["k"]);
        assert_eq!(field_names(&module, second), vec!["CS$<>8__locals1", "x"]);
        let link = module.find_field(second, "CS$<>8__locals1").unwrap();
        assert_eq!(module.types.kind(module.field(link).ty), &TypeKind::Def(first));

        let outer_method = method_named(&module, first, "<M>b__1");
        let text = print_method(&module, outer_method);
        assert!(text.contains("CS$<>8__locals2.CS$<>8__locals1 = this;"));
        assert!(text.contains("CS$<>8__locals2.x = x;"));
        assert!(text.contains("(CS$<>8__locals2.<M>b__2)"));

        let inner_method = method_named(&module, second, "<M>b__2");
        assert!(print_method(&module, inner_method)
            .contains("return this.x + this.CS$<>8__locals1.k;"));
        assert_eq!(module.validate(), Ok(()));
    }

    #[test]
    fn test_sibling_functions_lower_independently() {
        let (mut module, class, method) = setup(true);
        let int = module.types.int32();
        let x = module.add_param("x", int);
        let shadow = module.add_param("x", int);
        let k = module.add_local("k", int);
        let one = module.int(1);
        let first = module.lambda(vec![x], int, vec![ret(Some(param(x)))]);
        let inner = module.lambda(vec![shadow], int, vec![ret(Some(local(k)))]);
        let inner_delegate = delegate_of(&inner);
        let second = module.lambda(vec![], inner_delegate, vec![ret(Some(inner))]);
        let f1 = module.add_local("f1", delegate_of(&first));
        let f2 = module.add_local("f2", delegate_of(&second));
        module.set_body(
            method,
            vec![
                decl(f1, Some(first)),
                decl(k, Some(one)),
                decl(f2, Some(second)),
            ],
        );

        let result = lower(&mut module, method);

        let [Member::Method(peer)] = result.peer_members[..] else {
            panic!("expected one peer method, got {:?}", result.peer_members);
        };
        assert!(module.method(peer).is_static);
        assert_eq!(module.method(peer).owner, class);
        assert_eq!(module.method(peer).params, vec![x]);

        let [closure] = result.closure_types[..] else {
            panic!("expected one closure type");
        };
        assert_eq!(field_names(&module, closure), vec!["k"]);

        let outer = method_named(&module, closure, "<M>b__1");
        assert!(module.method(outer).params.is_empty());
        assert!(print_method(&module, outer).contains("(this.<M>b__2)"));
        let nested = method_named(&module, closure, "<M>b__2");
        assert_eq!(module.method(nested).params, vec![shadow]);
        assert!(print_method(&module, nested).contains("return this.k;"));
        assert_eq!(module.validate(), Ok(()));
    }

    #[test]
    fn test_captured_this_reached_through_closure() {
        let (mut module, class, method) = setup(false);
        let int = module.types.int32();
        let counter = module.add_field(class, "counter", int);
        let k = module.add_local("k", int);
        let one = module.int(1);
        let target = module.field_of(Expr::This, counter);
        let void = module.types.void();
        let f = module.lambda(vec![], void, vec![expr(assign(target, local(k)))]);
        module.set_body(method, vec![decl(k, Some(one)), expr(invoke(f, vec![]))]);

        let result = lower(&mut module, method);

        let closure = result.closure_types[0];
        assert_eq!(field_names(&module, closure), vec!["k", "<>__this"]);
        let text = print_method(&module, method);
        assert!(text.contains("CS$<>8__locals1.<>__this = this;"));
        let lowered = method_named(&module, closure, "<M>b__1");
        assert!(print_method(&module, lowered).contains("this.<>__this.counter = this.k;"));
    }

    #[test]
    fn test_each_loop_body_gets_its_own_closure() {
        let (mut module, _, method) = setup(true);
        let int = module.types.int32();
        let i = module.add_local("i", int);
        let one = module.int(1);
        let cond = module.boolean(true);
        let f = module.lambda(vec![], int, vec![ret(Some(local(i)))]);
        module.set_body(
            method,
            vec![Stmt::While {
                cond,
                body: Block::new(vec![decl(i, Some(one)), expr(invoke(f, vec![]))]),
            }],
        );

        lower(&mut module, method);

        let stmts = &module.method(method).body.as_ref().unwrap().stmts;
        assert_eq!(stmts.len(), 1);
        let Stmt::While { body, .. } = &stmts[0] else {
            panic!("expected the loop to stay in place");
        };
        assert!(matches!(
            &body.stmts[0],
            Stmt::Local {
                init: Some(Expr::New { .. }),
                ..
            }
        ));
    }

    #[test]
    fn test_constructor_copies_this_after_base_call() {
        let (mut module, class, _) = setup(false);
        let void = module.types.void();
        let int = module.types.int32();
        let counter = module.add_field(class, "counter", int);
        let ctor = module.add_method(class, ".ctor", void, false);
        module.make_constructor(ctor);
        let x = module.push_param(ctor, "x", int);
        let object_ctor = module.platform.object_ctor;
        let base = module.call(object_ctor, Some(Expr::This), vec![]);
        let target = module.field_of(Expr::This, counter);
        let f = module.lambda(vec![], void, vec![expr(assign(target, param(x)))]);
        module.set_body(ctor, vec![expr(base), expr(invoke(f, vec![]))]);

        lower(&mut module, ctor);

        let text = print_method(&module, ctor);
        let position = |needle: &str| {
            text.find(needle)
                .unwrap_or_else(|| panic!("missing `{}` in\n{}", needle, text))
        };
        let alloc = position("CS$<>8__locals1 = new");
        let copy_param = position("CS$<>8__locals1.x = x;");
        let base_call = position("this..ctor()");
        let copy_this = position("CS$<>8__locals1.<>__this = this;");
        assert!(alloc < copy_param);
        assert!(copy_param < base_call);
        assert!(base_call < copy_this);
    }

    #[test]
    fn test_generic_closure_mirrors_method_parameters() {
        let (mut module, _, method) = setup(true);
        let t = module.add_method_generic_param(method, "T");
        let value = module.push_param(method, "value", t);
        let f = module.lambda(vec![], t, vec![ret(Some(param(value)))]);
        let delegate = delegate_of(&f);
        let d = module.add_local("d", delegate);
        module.set_body(method, vec![decl(d, Some(f))]);

        let result = lower(&mut module, method);

        let closure = result.closure_types[0];
        assert_eq!(module.type_def(closure).generic_params[0].name, "T_");
        let own_param = module.types.type_param(closure, 0);
        let field = module.find_field(closure, "value").unwrap();
        assert_eq!(module.field(field).ty, own_param);
        let lowered = method_named(&module, closure, "<M>b__1");
        assert_eq!(module.method(lowered).return_type, own_param);

        let instantiated = module.types.instance(closure, vec![t]);
        let holder = module
            .locals
            .iter()
            .find(|l| l.name == "CS$<>8__locals1")
            .unwrap();
        assert_eq!(holder.ty, instantiated);
        // The delegate keeps the method's view of the type
        assert_eq!(module.local(d).ty, delegate);
    }

    #[test]
    fn test_generic_peer_is_instantiated_at_use() {
        let (mut module, _, method) = setup(true);
        let t = module.add_method_generic_param(method, "T");
        let a = module.add_param("a", t);
        let f = module.lambda(vec![a], t, vec![ret(Some(param(a)))]);
        module.set_body(method, vec![expr(f)]);

        let result = lower(&mut module, method);

        let [Member::Method(peer)] = result.peer_members[..] else {
            panic!("expected a peer method");
        };
        assert_eq!(module.method(peer).generic_params[0].name, "T");
        let peer_t = module.types.method_param(peer, 0);
        assert_eq!(module.param(a).ty, peer_t);
        assert_eq!(module.method(peer).return_type, peer_t);
        match &module.method(method).body.as_ref().unwrap().stmts[0] {
            Stmt::Expr(Expr::CreateDelegate { method: target, .. }) => {
                assert_eq!(target.type_args, vec![t])
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_foreign_method_parameter_is_fatal() {
        let (mut module, class, method) = setup(true);
        let void = module.types.void();
        let other = module.add_method(class, "G", void, true);
        let u = module.add_method_generic_param(other, "U");
        let a = module.add_param("a", u);
        let f = module.lambda(vec![a], u, vec![ret(Some(param(a)))]);
        module.set_body(method, vec![expr(f)]);

        let err = normalize_method(&mut module, method, &LowerOptions::default()).unwrap_err();
        assert!(matches!(err, LowerError::ForeignGenericParameter { .. }));
    }

    #[test]
    fn test_static_delegate_cache_is_opt_in() {
        let (mut module, class, method) = setup(true);
        let void = module.types.void();
        let f = module.lambda(vec![], void, vec![ret(None)]);
        module.set_body(method, vec![expr(f)]);
        let options = LowerOptions {
            cache_static_delegates: true,
            ..LowerOptions::default()
        };

        let result = normalize_method(&mut module, method, &options).unwrap();

        let cache = result
            .peer_members
            .iter()
            .find_map(|m| match m {
                Member::Field(f) => Some(*f),
                Member::Method(_) => None,
            })
            .unwrap();
        assert_eq!(module.field(cache).name, "CS$<>__CachedAnonymousMethodDelegate1");
        assert!(module.field(cache).is_static);
        assert_eq!(module.field(cache).owner, class);
        assert!(matches!(
            module.method(method).body.as_ref().unwrap().stmts[0],
            Stmt::Expr(Expr::Sequence { .. })
        ));
    }
}
