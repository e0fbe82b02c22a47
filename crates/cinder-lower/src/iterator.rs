//! Iterator state machines
//!
//! A method containing `yield` statements is replaced by a type implementing
//! the enumerator protocol. The original body moves into `MoveNext`, every
//! variable it touches becomes a field, and each `yield return` becomes a
//! state transition followed by a resumption label that a dispatch switch at
//! the top of `MoveNext` jumps back to.

use std::collections::HashMap;

use cinder_ir::builder::{assign, binary};
use cinder_ir::visit::{walk_expr, walk_stmt, Visit};
use cinder_ir::{
    type_name, BinaryOp, Block, Expr, FieldRef, MethodImpl, MethodRef, Module, Stmt,
    SwitchCase, Visibility,
};
use cinder_types::{FieldId, LabelId, LocalId, MethodId, ParamId, TypeDefId, TypeId, TypeKind};
use log::debug;

use crate::closure::SELF_FIELD;
use crate::error::{LowerError, Result};
use crate::subst::{qualified_name, Substitution};

/// State of an instance that has not started, or has finished
pub const FINISHED_STATE: i64 = -2;

/// The synthesized state machine type and its members
#[derive(Debug, Clone)]
pub struct IteratorClosure {
    pub def: TypeDefId,
    /// Element type, as seen from inside the type
    pub element_type: TypeId,
    /// Implements the sequence interfaces as well as the enumerator ones
    pub enumerable: bool,
    pub this_field: Option<FieldId>,
    pub param_fields: Vec<(ParamId, FieldId)>,
    pub local_fields: HashMap<LocalId, FieldId>,
    pub current: FieldId,
    pub state: FieldId,
    pub initial_thread_id: FieldId,
    pub ctor: MethodId,
    pub move_next: MethodId,
    pub reset: MethodId,
    pub dispose: MethodId,
    pub get_current: MethodId,
    pub non_generic_get_current: MethodId,
    pub get_enumerator: Option<MethodId>,
    pub non_generic_get_enumerator: Option<MethodId>,
    pub interfaces: Vec<TypeId>,
    /// Number of `yield return` sites, each owning one resumption state
    pub yield_states: usize,
}

/// Element type of a sequence or enumerator type, and whether it is a sequence.
fn classify(module: &mut Module, ty: TypeId) -> Option<(TypeId, bool)> {
    let p = &module.platform;
    let (generic_enumerable, generic_enumerator) = (p.generic_enumerable, p.generic_enumerator);
    let (enumerable, enumerator, object) = (p.enumerable, p.enumerator, p.object);
    match module.types.kind(ty).clone() {
        TypeKind::Instance { def, args } if args.len() == 1 && def == generic_enumerable => {
            Some((args[0], true))
        }
        TypeKind::Instance { def, args } if args.len() == 1 && def == generic_enumerator => {
            Some((args[0], false))
        }
        TypeKind::Def(def) if def == enumerable => Some((module.types.def(object), true)),
        TypeKind::Def(def) if def == enumerator => Some((module.types.def(object), false)),
        _ => None,
    }
}

/// Locals used by a body, in order of first appearance.
#[derive(Default)]
struct LocalCollector {
    order: Vec<LocalId>,
}

impl LocalCollector {
    fn note(&mut self, local: LocalId) {
        if !self.order.contains(&local) {
            self.order.push(local);
        }
    }
}

impl Visit for LocalCollector {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let Stmt::Local { local, .. } = stmt {
            self.note(*local);
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        if let Expr::Local(local) = expr {
            self.note(*local);
        }
        walk_expr(self, expr);
    }
}

/// Build the state machine for `method` from its closure-lowered `body`.
///
/// Returns the replacement body of `method` together with the new type.
pub fn lower_iterator(
    module: &mut Module,
    method: MethodId,
    body: Block,
    number: usize,
) -> Result<(Block, IteratorClosure)> {
    let m = module.method(method);
    let containing = m.owner;
    let is_static = m.is_static;
    let generic = !m.generic_params.is_empty();
    let params = m.params.clone();
    let return_type = m.return_type;
    let method_name = m.name.clone();

    let Some((element, enumerable)) = classify(module, return_type) else {
        return Err(LowerError::NotASequence {
            method: qualified_name(module, method),
            found: type_name(module, return_type),
        });
    };

    let def = module.add_type_def(
        format!("<{}>ic__{}", method_name, number),
        None,
        Some(containing),
    );
    {
        let td = module.type_def_mut(def);
        td.sealed = true;
        td.compiler_generated = true;
        td.visibility = Visibility::Private;
    }
    let subst = if generic {
        let subst = Substitution::onto_type(module, method, def);
        let copies = subst.duplicate_params(module, |p| format!("{}_", p.name))?;
        module.type_def_mut(def).generic_params = copies;
        subst
    } else {
        Substitution::new(module, method, Vec::new())
    };
    let self_ty = module.self_type(def);
    let element_type = subst.apply(&mut module.types, element)?;

    let p = module.platform.clone();
    let generic_enumerator_ty = module.types.instance(p.generic_enumerator, vec![element_type]);
    let enumerator_ty = module.types.def(p.enumerator);
    let disposable_ty = module.types.def(p.disposable);
    let mut interfaces = Vec::new();
    let mut generic_enumerable_ty = None;
    if enumerable {
        let ty = module.types.instance(p.generic_enumerable, vec![element_type]);
        generic_enumerable_ty = Some(ty);
        interfaces.push(ty);
        interfaces.push(module.types.def(p.enumerable));
    }
    interfaces.extend([generic_enumerator_ty, enumerator_ty, disposable_ty]);
    module.type_def_mut(def).interfaces = interfaces.clone();

    // Fields
    let this_field = if is_static {
        None
    } else {
        let ty = module.self_type(containing);
        Some(module.add_field(def, SELF_FIELD, ty))
    };
    let mut param_fields = Vec::with_capacity(params.len());
    for param in &params {
        let (name, ty) = (module.param(*param).name.clone(), module.param(*param).ty);
        let ty = subst.apply(&mut module.types, ty)?;
        param_fields.push((*param, module.add_field(def, name, ty)));
    }
    let mut collector = LocalCollector::default();
    collector.visit_block(&body);
    let mut local_fields = HashMap::new();
    for local in collector.order {
        let (name, ty) = (module.local(local).name.clone(), module.local(local).ty);
        let ty = subst.apply(&mut module.types, ty)?;
        let field = module.add_field(def, format!("<>__{}{}", name, number), ty);
        local_fields.insert(local, field);
    }
    let int32 = module.types.int32();
    let current = module.add_field(def, "<>__current", element_type);
    let state = module.add_field(def, "<>__state", int32);
    let initial_thread_id = module.add_field(def, "<>__l_initialThreadId", int32);

    let layout = Layout {
        self_ty,
        this: this_field,
        params: param_fields,
        locals: local_fields,
        state,
        current,
        initial_thread_id,
    };

    let ctor = define_constructor(module, def, &layout);

    let boolean = module.types.bool();
    let move_next = protocol_method(module, def, "MoveNext", boolean, false);
    let mut rewriter = StateMachineRewriter {
        module: &mut *module,
        layout: &layout,
        subst: &subst,
        method,
        resume: Vec::new(),
    };
    let move_next_body = rewriter.build_move_next(body)?;
    let yield_states = rewriter.resume.len().saturating_sub(1);
    module.method_mut(move_next).body = Some(move_next_body);

    let void = module.types.void();
    let reset = protocol_method(module, def, "Reset", void, false);
    let dispose = protocol_method(module, def, "Dispose", void, false);
    for noop in [reset, dispose] {
        module.method_mut(noop).body = Some(Block::new(vec![Stmt::Return(None)]));
    }

    let element_name = type_name(module, element_type);
    let get_current = protocol_method(
        module,
        def,
        &format!("System.Collections.Generic.IEnumerator<{}>.get_Current", element_name),
        element_type,
        true,
    );
    module.method_mut(get_current).body = Some(Block::new(vec![Stmt::Return(Some(
        layout.read(current),
    ))]));

    let object = module.types.def(p.object);
    let non_generic_get_current = protocol_method(
        module,
        def,
        "System.Collections.IEnumerator.get_Current",
        object,
        true,
    );
    let mut value = layout.read(current);
    if !module.is_reference_type(element_type) {
        value = Expr::Convert {
            value: Box::new(value),
            ty: object,
        };
    }
    module.method_mut(non_generic_get_current).body =
        Some(Block::new(vec![Stmt::Return(Some(value))]));

    let (get_enumerator, non_generic_get_enumerator) = match generic_enumerable_ty {
        Some(generic_enumerable_ty) => {
            let get_enumerator = protocol_method(
                module,
                def,
                &format!(
                    "System.Collections.Generic.IEnumerable<{}>.GetEnumerator",
                    element_name
                ),
                generic_enumerator_ty,
                false,
            );
            let body = get_enumerator_body(module, ctor, &layout);
            module.method_mut(get_enumerator).body = Some(body);

            let non_generic = protocol_method(
                module,
                def,
                "System.Collections.IEnumerable.GetEnumerator",
                enumerator_ty,
                false,
            );
            let forward = Expr::Call {
                method: MethodRef {
                    method: get_enumerator,
                    owner: self_ty,
                    type_args: Vec::new(),
                },
                receiver: Some(Box::new(Expr::This)),
                args: Vec::new(),
            };
            module.method_mut(non_generic).body =
                Some(Block::new(vec![Stmt::Return(Some(forward))]));

            let enumerable_ty = module.types.def(p.enumerable);
            bind(
                module,
                def,
                self_ty,
                get_enumerator,
                p.generic_enumerable_get_enumerator,
                generic_enumerable_ty,
            );
            bind(module, def, self_ty, non_generic, p.enumerable_get_enumerator, enumerable_ty);
            (Some(get_enumerator), Some(non_generic))
        }
        None => (None, None),
    };

    bind(
        module,
        def,
        self_ty,
        get_current,
        p.generic_enumerator_get_current,
        generic_enumerator_ty,
    );
    bind(
        module,
        def,
        self_ty,
        non_generic_get_current,
        p.enumerator_get_current,
        enumerator_ty,
    );
    bind(module, def, self_ty, move_next, p.enumerator_move_next, enumerator_ty);
    bind(module, def, self_ty, reset, p.enumerator_reset, enumerator_ty);
    bind(module, def, self_ty, dispose, p.dispose, disposable_ty);

    debug!(
        "iterator type {} with {} resumption states",
        module.type_def(def).name,
        yield_states
    );

    let closure = IteratorClosure {
        def,
        element_type,
        enumerable,
        this_field: layout.this,
        param_fields: layout.params,
        local_fields: layout.locals,
        current,
        state,
        initial_thread_id,
        ctor,
        move_next,
        reset,
        dispose,
        get_current,
        non_generic_get_current,
        get_enumerator,
        non_generic_get_enumerator,
        interfaces,
        yield_states,
    };
    let replacement = replacement_body(module, method, &closure);
    Ok((replacement, closure))
}

/// Where the state machine keeps everything, read through `this`
struct Layout {
    self_ty: TypeId,
    this: Option<FieldId>,
    params: Vec<(ParamId, FieldId)>,
    locals: HashMap<LocalId, FieldId>,
    state: FieldId,
    current: FieldId,
    initial_thread_id: FieldId,
}

impl Layout {
    fn read(&self, field: FieldId) -> Expr {
        Expr::Field {
            target: Some(Box::new(Expr::This)),
            field: FieldRef {
                field,
                owner: self.self_ty,
            },
        }
    }
}

fn protocol_method(
    module: &mut Module,
    def: TypeDefId,
    name: &str,
    return_type: TypeId,
    special: bool,
) -> MethodId {
    let method = module.add_method(def, name, return_type, false);
    let m = module.method_mut(method);
    m.is_virtual = true;
    m.special_name = special;
    m.compiler_generated = true;
    if name.contains('.') {
        m.visibility = Visibility::Private;
    }
    method
}

fn bind(
    module: &mut Module,
    def: TypeDefId,
    self_ty: TypeId,
    implementing: MethodId,
    implemented: MethodId,
    interface: TypeId,
) {
    module.type_def_mut(def).method_impls.push(MethodImpl {
        implementing: MethodRef {
            method: implementing,
            owner: self_ty,
            type_args: Vec::new(),
        },
        implemented: MethodRef {
            method: implemented,
            owner: interface,
            type_args: Vec::new(),
        },
    });
}

/// `Thread.get_CurrentThread().get_ManagedThreadId()`
fn current_thread_id(module: &mut Module) -> Expr {
    let thread = module.method_ref(module.platform.current_thread);
    let id = module.method_ref(module.platform.managed_thread_id);
    Expr::Call {
        method: id,
        receiver: Some(Box::new(Expr::Call {
            method: thread,
            receiver: None,
            args: Vec::new(),
        })),
        args: Vec::new(),
    }
}

/// `.ctor(int32 state)`: base call, initial state, creating thread.
fn define_constructor(module: &mut Module, def: TypeDefId, layout: &Layout) -> MethodId {
    let void = module.types.void();
    let int32 = module.types.int32();
    let ctor = module.add_method(def, ".ctor", void, false);
    module.make_constructor(ctor);
    module.method_mut(ctor).compiler_generated = true;
    let state = module.push_param(ctor, "state", int32);
    let base = module.method_ref(module.platform.object_ctor);
    let thread_id = current_thread_id(module);
    module.method_mut(ctor).body = Some(Block::new(vec![
        Stmt::Expr(Expr::Call {
            method: base,
            receiver: Some(Box::new(Expr::This)),
            args: Vec::new(),
        }),
        Stmt::Expr(assign(layout.read(layout.state), Expr::Param(state))),
        Stmt::Expr(assign(layout.read(layout.initial_thread_id), thread_id)),
        Stmt::Return(None),
    ]));
    ctor
}

/// Reuse the instance on its creating thread before it has started, otherwise
/// hand out a fresh copy holding the same arguments.
fn get_enumerator_body(module: &mut Module, ctor: MethodId, layout: &Layout) -> Block {
    let finished = module.int(FINISHED_STATE);
    let zero = module.int(0);
    let thread_id = current_thread_id(module);
    let reuse = Stmt::If {
        cond: binary(
            BinaryOp::And,
            binary(BinaryOp::Eq, layout.read(layout.state), finished),
            binary(BinaryOp::Eq, layout.read(layout.initial_thread_id), thread_id),
        ),
        then_block: Block::new(vec![
            Stmt::Expr(assign(layout.read(layout.state), zero)),
            Stmt::Return(Some(Expr::This)),
        ]),
        else_block: None,
    };

    let fresh = module.add_local("enumerator", layout.self_ty);
    let zero = module.int(0);
    let mut stmts = vec![
        reuse,
        Stmt::Local {
            local: fresh,
            init: Some(Expr::New {
                ctor: MethodRef {
                    method: ctor,
                    owner: layout.self_ty,
                    type_args: Vec::new(),
                },
                args: vec![zero],
            }),
        },
    ];
    let copied = layout
        .this
        .into_iter()
        .chain(layout.params.iter().map(|(_, f)| *f));
    for field in copied {
        let target = Expr::Field {
            target: Some(Box::new(Expr::Local(fresh))),
            field: FieldRef {
                field,
                owner: layout.self_ty,
            },
        };
        stmts.push(Stmt::Expr(assign(target, layout.read(field))));
    }
    stmts.push(Stmt::Return(Some(Expr::Local(fresh))));
    Block::new(stmts)
}

/// New body of the iterator method: allocate, copy arguments, return.
fn replacement_body(
    module: &mut Module,
    method: MethodId,
    closure: &IteratorClosure,
) -> Block {
    let args = module.method_type_params(method);
    let outside_ty = module.types.instance(closure.def, args);
    let local = module.add_local("iteratorClosureLocal", outside_ty);
    let initial = module.int(if closure.enumerable { FINISHED_STATE } else { 0 });

    let field = |field: FieldId| Expr::Field {
        target: Some(Box::new(Expr::Local(local))),
        field: FieldRef {
            field,
            owner: outside_ty,
        },
    };
    let mut stmts = vec![Stmt::Local {
        local,
        init: Some(Expr::New {
            ctor: MethodRef {
                method: closure.ctor,
                owner: outside_ty,
                type_args: Vec::new(),
            },
            args: vec![initial],
        }),
    }];
    if let Some(this) = closure.this_field {
        stmts.push(Stmt::Expr(assign(field(this), Expr::This)));
    }
    for (param, f) in &closure.param_fields {
        stmts.push(Stmt::Expr(assign(field(*f), Expr::Param(*param))));
    }
    stmts.push(Stmt::Return(Some(Expr::Local(local))));
    Block::new(stmts)
}

/// Turns the original body into the body of `MoveNext`
struct StateMachineRewriter<'a> {
    module: &'a mut Module,
    layout: &'a Layout,
    subst: &'a Substitution,
    method: MethodId,
    /// Resumption label of each state, state 0 first
    resume: Vec<(i32, LabelId)>,
}

impl StateMachineRewriter<'_> {
    fn build_move_next(&mut self, body: Block) -> Result<Block> {
        let entry = self.module.new_label();
        self.resume.push((0, entry));
        let rewritten = self.rewrite_stmts(body.stmts)?;
        let return_false = self.module.new_label();

        let dispatch = Stmt::Switch {
            value: self.layout.read(self.layout.state),
            cases: self
                .resume
                .iter()
                .map(|(value, label)| SwitchCase {
                    value: *value,
                    body: vec![Stmt::Goto(*label)],
                })
                .collect(),
            default: Some(vec![Stmt::Goto(return_false)]),
        };
        let no = self.module.boolean(false);

        let mut stmts = Vec::with_capacity(rewritten.len() + 4);
        stmts.push(dispatch);
        stmts.push(Stmt::Label(entry));
        stmts.extend(rewritten);
        stmts.push(Stmt::Label(return_false));
        stmts.push(Stmt::Return(Some(no)));
        Ok(Block::new(stmts))
    }

    fn rewrite_stmts(&mut self, stmts: Vec<Stmt>) -> Result<Vec<Stmt>> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.rewrite_stmt(stmt, &mut out)?;
        }
        Ok(out)
    }

    fn rewrite_block(&mut self, block: Block) -> Result<Block> {
        Ok(Block {
            scope: block.scope,
            stmts: self.rewrite_stmts(block.stmts)?,
        })
    }

    fn rewrite_stmt(&mut self, stmt: Stmt, out: &mut Vec<Stmt>) -> Result<()> {
        match stmt {
            Stmt::YieldReturn(mut value) => {
                self.rewrite_expr(&mut value)?;
                let state = self.resume.len() as i32;
                let label = self.module.new_label();
                self.resume.push((state, label));
                let state_value = self.module.int(state as i64);
                let yes = self.module.boolean(true);
                out.push(Stmt::Expr(assign(
                    self.layout.read(self.layout.state),
                    state_value,
                )));
                out.push(Stmt::Expr(assign(self.layout.read(self.layout.current), value)));
                out.push(Stmt::Return(Some(yes)));
                out.push(Stmt::Label(label));
            }
            Stmt::YieldBreak => {
                let finished = self.module.int(FINISHED_STATE);
                let no = self.module.boolean(false);
                out.push(Stmt::Expr(assign(self.layout.read(self.layout.state), finished)));
                out.push(Stmt::Return(Some(no)));
            }
            Stmt::Local { local, init } => {
                let field = self.local_field(local)?;
                out.push(match init {
                    Some(mut init) => {
                        self.rewrite_expr(&mut init)?;
                        Stmt::Expr(assign(self.layout.read(field), init))
                    }
                    None => Stmt::Empty,
                });
            }
            Stmt::Block(block) => out.push(Stmt::Block(self.rewrite_block(block)?)),
            Stmt::Expr(mut expr) => {
                self.rewrite_expr(&mut expr)?;
                out.push(Stmt::Expr(expr));
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(mut value) => {
                        self.rewrite_expr(&mut value)?;
                        Some(value)
                    }
                    None => None,
                };
                out.push(Stmt::Return(value));
            }
            Stmt::If {
                mut cond,
                then_block,
                else_block,
            } => {
                self.rewrite_expr(&mut cond)?;
                let then_block = self.rewrite_block(then_block)?;
                let else_block = match else_block {
                    Some(block) => Some(self.rewrite_block(block)?),
                    None => None,
                };
                out.push(Stmt::If {
                    cond,
                    then_block,
                    else_block,
                });
            }
            Stmt::While { mut cond, body } => {
                self.rewrite_expr(&mut cond)?;
                let body = self.rewrite_block(body)?;
                out.push(Stmt::While { cond, body });
            }
            Stmt::Switch {
                mut value,
                cases,
                default,
            } => {
                self.rewrite_expr(&mut value)?;
                let mut new_cases = Vec::with_capacity(cases.len());
                for case in cases {
                    new_cases.push(SwitchCase {
                        value: case.value,
                        body: self.rewrite_stmts(case.body)?,
                    });
                }
                let default = match default {
                    Some(stmts) => Some(self.rewrite_stmts(stmts)?),
                    None => None,
                };
                out.push(Stmt::Switch {
                    value,
                    cases: new_cases,
                    default,
                });
            }
            stmt @ (Stmt::Label(_) | Stmt::Goto(_) | Stmt::Empty) => out.push(stmt),
        }
        Ok(())
    }

    fn local_field(&self, local: LocalId) -> Result<FieldId> {
        self.layout
            .locals
            .get(&local)
            .copied()
            .ok_or_else(|| self.unbound(self.module.local(local).name.clone()))
    }

    fn unbound(&self, variable: String) -> LowerError {
        LowerError::UnboundVariable {
            method: qualified_name(self.module, self.method),
            variable,
        }
    }

    fn rewrite_expr(&mut self, expr: &mut Expr) -> Result<()> {
        match expr {
            Expr::Local(local) => {
                let field = self.local_field(*local)?;
                *expr = self.layout.read(field);
                return Ok(());
            }
            Expr::Param(param) => {
                let param = *param;
                let field = self
                    .layout
                    .params
                    .iter()
                    .find(|(p, _)| *p == param)
                    .map(|(_, f)| *f)
                    .ok_or_else(|| self.unbound(self.module.param(param).name.clone()))?;
                *expr = self.layout.read(field);
                return Ok(());
            }
            Expr::This => {
                let field = self
                    .layout
                    .this
                    .ok_or_else(|| self.unbound("this".to_string()))?;
                *expr = self.layout.read(field);
                return Ok(());
            }
            Expr::Lambda(_) => {
                return Err(LowerError::UnexpectedAnonymousFunction {
                    method: qualified_name(self.module, self.method),
                })
            }
            _ => {}
        }

        self.subst.apply_to_node(&mut self.module.types, expr)?;
        match expr {
            Expr::Field { target, .. } => {
                if let Some(target) = target {
                    self.rewrite_expr(target)?;
                }
            }
            Expr::Assign { target, value } => {
                self.rewrite_expr(target)?;
                self.rewrite_expr(value)?;
            }
            Expr::Binary { lhs, rhs, .. } => {
                self.rewrite_expr(lhs)?;
                self.rewrite_expr(rhs)?;
            }
            Expr::Not(inner) | Expr::Convert { value: inner, .. } => self.rewrite_expr(inner)?,
            Expr::Call { receiver, args, .. } => {
                if let Some(receiver) = receiver {
                    self.rewrite_expr(receiver)?;
                }
                for arg in args {
                    self.rewrite_expr(arg)?;
                }
            }
            Expr::New { args, .. } => {
                for arg in args {
                    self.rewrite_expr(arg)?;
                }
            }
            Expr::Invoke { delegate, args } => {
                self.rewrite_expr(delegate)?;
                for arg in args {
                    self.rewrite_expr(arg)?;
                }
            }
            Expr::CreateDelegate { receiver, .. } => {
                if let Some(receiver) = receiver {
                    self.rewrite_expr(receiver)?;
                }
            }
            Expr::Sequence { stmts, value } => {
                *stmts = self.rewrite_stmts(std::mem::take(stmts))?;
                self.rewrite_expr(value)?;
            }
            Expr::Const { .. }
            | Expr::Local(_)
            | Expr::Param(_)
            | Expr::This
            | Expr::Lambda(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_method;
    use crate::options::LowerOptions;
    use cinder_ir::builder::{decl, expr, local, param};
    use cinder_ir::print_method;

    fn sequence_method(
        module: &mut Module,
        name: &str,
        element: TypeId,
        is_static: bool,
    ) -> (TypeDefId, MethodId) {
        let class = module.add_class("C");
        let ty = module.types.instance(module.platform.generic_enumerable, vec![element]);
        let method = module.add_method(class, name, ty, is_static);
        (class, method)
    }

    fn lower(module: &mut Module, method: MethodId) -> IteratorClosure {
        normalize_method(module, method, &LowerOptions::default())
            .unwrap()
            .iterator
            .expect("iterator type")
    }

    fn field_names(module: &Module, def: TypeDefId) -> Vec<String> {
        module
            .type_def(def)
            .fields
            .iter()
            .map(|f| module.field(*f).name.clone())
            .collect()
    }

    fn body(module: &Module, method: MethodId) -> &[Stmt] {
        &module.method(method).body.as_ref().unwrap().stmts
    }

    #[test]
    fn test_each_yield_gets_a_state() {
        let mut module = Module::new("test");
        let int = module.types.int32();
        let (class, method) = sequence_method(&mut module, "Count", int, true);
        let one = module.int(1);
        let two = module.int(2);
        module.set_body(method, vec![Stmt::YieldReturn(one), Stmt::YieldReturn(two)]);

        let it = lower(&mut module, method);

        assert_eq!(module.type_def(it.def).name, "<Count>ic__1");
        assert_eq!(module.type_def(it.def).declaring, Some(class));
        assert!(it.enumerable);
        assert_eq!(it.element_type, int);
        assert_eq!(it.yield_states, 2);
        assert_eq!(
            field_names(&module, it.def),
            vec!["<>__current", "<>__state", "<>__l_initialThreadId"]
        );
        assert_eq!(module.field(it.current).ty, int);

        let Stmt::Switch { cases, default, .. } = &body(&module, it.move_next)[0] else {
            panic!("MoveNext must start with the state dispatch");
        };
        let states: Vec<i32> = cases.iter().map(|c| c.value).collect();
        assert_eq!(states, vec![0, 1, 2]);
        assert!(default.is_some());

        let text = print_method(&module, it.move_next);
        assert!(text.contains("this.<>__state = 1;"));
        assert!(text.contains("this.<>__current = 1;"));
        assert!(text.contains("this.<>__state = 2;"));
        assert!(text.contains("this.<>__current = 2;"));
        assert!(text.contains("return true;"));
        assert!(text.contains("return false;"));

        let text = print_method(&module, method);
        assert!(text.contains("<Count>ic__1 iteratorClosureLocal = new <Count>ic__1(-2);"));
        assert!(text.contains("return iteratorClosureLocal;"));
        assert_eq!(module.validate(), Ok(()));
    }

    #[test]
    fn test_dispatch_jumps_to_resumption_labels() {
        let mut module = Module::new("test");
        let int = module.types.int32();
        let (_, method) = sequence_method(&mut module, "Count", int, true);
        let one = module.int(1);
        let two = module.int(2);
        module.set_body(method, vec![Stmt::YieldReturn(one), Stmt::YieldReturn(two)]);

        let it = lower(&mut module, method);

        let stmts = body(&module, it.move_next);
        let labels: Vec<LabelId> = stmts
            .iter()
            .filter_map(|s| match s {
                Stmt::Label(label) => Some(*label),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), 4);
        for (i, label) in labels.iter().enumerate() {
            assert!(!labels[i + 1..].contains(label));
        }

        let Stmt::Switch { cases, default, .. } = &stmts[0] else {
            panic!("MoveNext must start with the state dispatch");
        };
        let targets: Vec<LabelId> = cases
            .iter()
            .map(|c| match c.body.as_slice() {
                [Stmt::Goto(label)] => *label,
                other => panic!("unexpected case body {:?}", other),
            })
            .collect();
        assert_eq!(targets, labels[..3].to_vec());
        assert_eq!(default.as_deref(), Some(&[Stmt::Goto(labels[3])][..]));
        assert_eq!(stmts[1], Stmt::Label(labels[0]));
    }

    #[test]
    fn test_sequence_implements_all_protocol_members() {
        let mut module = Module::new("test");
        let int = module.types.int32();
        let (_, method) = sequence_method(&mut module, "Count", int, true);
        let one = module.int(1);
        module.set_body(method, vec![Stmt::YieldReturn(one)]);

        let it = lower(&mut module, method);

        assert_eq!(it.interfaces.len(), 5);
        assert_eq!(module.type_def(it.def).method_impls.len(), 7);
        let get_enumerator = it.get_enumerator.unwrap();
        assert_eq!(
            module.method(get_enumerator).name,
            "System.Collections.Generic.IEnumerable<int32>.GetEnumerator"
        );
        assert_eq!(module.method(get_enumerator).visibility, Visibility::Private);
        assert!(module.method(it.move_next).is_virtual);
        for noop in [it.reset, it.dispose] {
            assert_eq!(body(&module, noop), &[Stmt::Return(None)]);
        }

        let text = print_method(&module, get_enumerator);
        assert!(text.contains("if ((this.<>__state == -2) && (this.<>__l_initialThreadId == "));
        assert!(text.contains("this.<>__state = 0;"));
        assert!(text.contains("enumerator = new <Count>ic__1(0);"));
        assert!(text.contains("return enumerator;"));

        // Value elements are boxed through the non-generic accessor
        match &body(&module, it.non_generic_get_current)[0] {
            Stmt::Return(Some(Expr::Convert { ty, .. })) => {
                assert_eq!(module.types.kind(*ty), &TypeKind::Def(module.platform.object))
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_enumerator_method_starts_ready() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let int = module.types.int32();
        let ty = module.types.instance(module.platform.generic_enumerator, vec![int]);
        let method = module.add_method(class, "Next", ty, true);
        let one = module.int(1);
        module.set_body(method, vec![Stmt::YieldReturn(one)]);

        let it = lower(&mut module, method);

        assert!(!it.enumerable);
        assert!(it.get_enumerator.is_none());
        assert!(it.non_generic_get_enumerator.is_none());
        assert_eq!(it.interfaces.len(), 3);
        assert!(print_method(&module, method).contains("new <Next>ic__1(0);"));
    }

    #[test]
    fn test_non_generic_sequence_yields_objects() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let ty = module.types.def(module.platform.enumerable);
        let object = module.types.def(module.platform.object);
        let method = module.add_method(class, "Items", ty, true);
        let s = Expr::Const {
            value: cinder_ir::Constant::Str("a".into()),
            ty: module.types.string(),
        };
        module.set_body(method, vec![Stmt::YieldReturn(s)]);

        let it = lower(&mut module, method);

        assert_eq!(it.element_type, object);
        assert_eq!(module.field(it.current).ty, object);
        assert!(matches!(
            body(&module, it.non_generic_get_current)[0],
            Stmt::Return(Some(Expr::Field { .. }))
        ));
    }

    #[test]
    fn test_state_lives_in_fields() {
        let mut module = Module::new("test");
        let int = module.types.int32();
        let (_, method) = sequence_method(&mut module, "Range", int, false);
        let n = module.push_param(method, "n", int);
        let i = module.add_local("i", int);
        let zero = module.int(0);
        let one = module.int(1);
        let cond = binary(BinaryOp::Lt, local(i), param(n));
        let step = assign(local(i), binary(BinaryOp::Add, local(i), one));
        module.set_body(
            method,
            vec![
                decl(i, Some(zero)),
                Stmt::While {
                    cond,
                    body: Block::new(vec![Stmt::YieldReturn(local(i)), expr(step)]),
                },
                Stmt::YieldBreak,
            ],
        );

        let it = lower(&mut module, method);

        assert_eq!(
            field_names(&module, it.def),
            vec![
                "<>__this",
                "n",
                "<>__i1",
                "<>__current",
                "<>__state",
                "<>__l_initialThreadId"
            ]
        );
        assert_eq!(it.local_fields.len(), 1);

        let text = print_method(&module, it.move_next);
        assert!(text.contains("this.<>__i1 = 0;"));
        assert!(text.contains("while (this.<>__i1 < this.n) {"));
        assert!(text.contains("this.<>__current = this.<>__i1;"));
        assert!(text.contains("this.<>__i1 = this.<>__i1 + 1;"));
        assert!(text.contains("this.<>__state = -2;"));

        let text = print_method(&module, method);
        assert!(text.contains("iteratorClosureLocal.<>__this = this;"));
        assert!(text.contains("iteratorClosureLocal.n = n;"));

        let text = print_method(&module, it.get_enumerator.unwrap());
        assert!(text.contains("enumerator.<>__this = this.<>__this;"));
        assert!(text.contains("enumerator.n = this.n;"));
    }

    #[test]
    fn test_generic_iterator_gets_own_parameters() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let void = module.types.void();
        let method = module.add_method(class, "Repeat", void, true);
        let t = module.add_method_generic_param(method, "T");
        let ty = module.types.instance(module.platform.generic_enumerable, vec![t]);
        module.method_mut(method).return_type = ty;
        let value = module.push_param(method, "value", t);
        module.set_body(method, vec![Stmt::YieldReturn(param(value))]);

        let it = lower(&mut module, method);

        assert_eq!(module.type_def(it.def).generic_params[0].name, "T_");
        let own = module.types.type_param(it.def, 0);
        assert_eq!(it.element_type, own);
        let (_, field) = it.param_fields[0];
        assert_eq!(module.field(field).ty, own);

        let outside = module.types.instance(it.def, vec![t]);
        let holder = module
            .locals
            .iter()
            .find(|l| l.name == "iteratorClosureLocal")
            .unwrap();
        assert_eq!(holder.ty, outside);
    }

    #[test]
    fn test_return_type_must_be_a_sequence() {
        let mut module = Module::new("test");
        let class = module.add_class("C");
        let int = module.types.int32();
        let method = module.add_method(class, "Bad", int, true);
        let one = module.int(1);
        module.set_body(method, vec![Stmt::YieldReturn(one)]);

        let err = normalize_method(&mut module, method, &LowerOptions::default()).unwrap_err();
        assert_eq!(
            err,
            LowerError::NotASequence {
                method: "C::Bad".to_string(),
                found: "int32".to_string(),
            }
        );
    }
}
