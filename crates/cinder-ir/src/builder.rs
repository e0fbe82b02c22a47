//! Helpers for constructing modules and method bodies

use cinder_types::{GenericParam, LocalId, MethodId, ParamId, TypeDefId, TypeId};

use crate::ir::{AnonymousFunction, BinaryOp, Block, Constant, Expr, FnId, Module, Stmt};
use crate::platform::mark_constructor;

impl Module {
    /// Add a top-level class.
    pub fn add_class(&mut self, name: impl Into<String>) -> TypeDefId {
        self.add_type_def(name, None, None)
    }

    /// Add an instance constructor that only calls the base constructor.
    pub fn add_default_constructor(&mut self, owner: TypeDefId) -> MethodId {
        let void = self.types.void();
        let ctor = self.add_method(owner, ".ctor", void, false);
        mark_constructor(self, ctor);
        let base = self.method_ref(self.platform.object_ctor);
        self.method_mut(ctor).body = Some(Block::new(vec![Stmt::Expr(Expr::Call {
            method: base,
            receiver: Some(Box::new(Expr::This)),
            args: Vec::new(),
        })]));
        ctor
    }

    /// Mark a method as an instance constructor.
    pub fn make_constructor(&mut self, method: MethodId) {
        mark_constructor(self, method);
    }

    /// Add a type parameter to a generic method and return its type.
    pub fn add_method_generic_param(&mut self, method: MethodId, name: impl Into<String>) -> TypeId {
        let index = self.method(method).generic_params.len() as u16;
        self.method_mut(method)
            .generic_params
            .push(GenericParam::new(name));
        self.types.method_param(method, index)
    }

    pub fn set_body(&mut self, method: MethodId, stmts: Vec<Stmt>) {
        self.method_mut(method).body = Some(Block::new(stmts));
    }

    /// Build an anonymous function converting to a delegate of matching shape.
    pub fn lambda(&mut self, params: Vec<ParamId>, return_type: TypeId, stmts: Vec<Stmt>) -> Expr {
        let param_types = params.iter().map(|p| self.param(*p).ty).collect();
        let delegate_type = self.types.delegate(param_types, return_type);
        Expr::Lambda(Box::new(AnonymousFunction {
            id: FnId::default(),
            params,
            return_type,
            delegate_type,
            body: Block::new(stmts),
        }))
    }

    pub fn int(&mut self, value: i64) -> Expr {
        Expr::Const {
            value: Constant::Int(value),
            ty: self.types.int32(),
        }
    }

    pub fn boolean(&mut self, value: bool) -> Expr {
        Expr::Const {
            value: Constant::Bool(value),
            ty: self.types.bool(),
        }
    }

    /// Field read through an instance.
    pub fn field_of(&mut self, target: Expr, field: cinder_types::FieldId) -> Expr {
        let field = self.field_ref(field);
        Expr::Field {
            target: Some(Box::new(target)),
            field,
        }
    }

    /// Call of a method on the receiver's self instance.
    pub fn call(&mut self, method: MethodId, receiver: Option<Expr>, args: Vec<Expr>) -> Expr {
        let method = self.method_ref(method);
        Expr::Call {
            method,
            receiver: receiver.map(Box::new),
            args,
        }
    }
}

pub fn local(id: LocalId) -> Expr {
    Expr::Local(id)
}

pub fn param(id: ParamId) -> Expr {
    Expr::Param(id)
}

pub fn assign(target: Expr, value: Expr) -> Expr {
    Expr::Assign {
        target: Box::new(target),
        value: Box::new(value),
    }
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

pub fn invoke(delegate: Expr, args: Vec<Expr>) -> Expr {
    Expr::Invoke {
        delegate: Box::new(delegate),
        args,
    }
}

pub fn decl(local: LocalId, init: Option<Expr>) -> Stmt {
    Stmt::Local { local, init }
}

pub fn expr(expr: Expr) -> Stmt {
    Stmt::Expr(expr)
}

pub fn ret(value: Option<Expr>) -> Stmt {
    Stmt::Return(value)
}

pub fn block(stmts: Vec<Stmt>) -> Stmt {
    Stmt::Block(Block::new(stmts))
}
