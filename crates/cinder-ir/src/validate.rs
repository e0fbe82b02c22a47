//! Structural checks for modules loaded from outside the compiler

use thiserror::Error;

use cinder_types::{GenericParam, TypeId, TypeKind};

use crate::ir::{Expr, MethodRef, Module, Stmt};
use crate::visit::{walk_expr, walk_stmt, Visit};

/// Inconsistencies in a module's arenas
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("{arena} entry at position {position} carries id {id}")]
    MisplacedId {
        arena: &'static str,
        position: usize,
        id: u32,
    },
    #[error("{what} refers to undefined {arena} {id}")]
    Dangling {
        what: String,
        arena: &'static str,
        id: u32,
    },
}

impl Module {
    /// Check that every id stored in the module refers to an existing definition.
    pub fn validate(&self) -> Result<(), IrError> {
        check_positions("type", self.type_defs.iter().map(|t| t.id.0))?;
        check_positions("method", self.methods.iter().map(|m| m.id.0))?;
        check_positions("field", self.fields.iter().map(|f| f.id.0))?;
        check_positions("local", self.locals.iter().map(|l| l.id.0))?;
        check_positions("param", self.params.iter().map(|p| p.id.0))?;

        for (id, kind) in self.types.iter() {
            let what = format!("type {}", id);
            match kind {
                TypeKind::Def(def)
                | TypeKind::Instance { def, .. }
                | TypeKind::TypeParam { owner: def, .. } => {
                    self.check("type definition", def.0, self.type_defs.len(), &what)?
                }
                TypeKind::MethodParam { owner, .. } => {
                    self.check("method", owner.0, self.methods.len(), &what)?
                }
                _ => {}
            }
            for child in kind.children() {
                self.check_type(child, &what)?;
            }
        }
        self.check_platform()?;

        for def in &self.type_defs {
            let what = format!("type {}", def.name);
            if let Some(declaring) = def.declaring {
                self.check("type definition", declaring.0, self.type_defs.len(), &what)?;
            }
            for nested in &def.nested {
                self.check("type definition", nested.0, self.type_defs.len(), &what)?;
            }
            for ty in def.base.iter().chain(&def.interfaces) {
                self.check_type(*ty, &what)?;
            }
            self.check_generic_params(&def.generic_params, &what)?;
            for field in &def.fields {
                self.check("field", field.0, self.fields.len(), &what)?;
            }
            for method in &def.methods {
                self.check("method", method.0, self.methods.len(), &what)?;
            }
            for binding in &def.method_impls {
                self.check_method_ref(&binding.implementing, &what)?;
                self.check_method_ref(&binding.implemented, &what)?;
            }
        }

        for method in &self.methods {
            let what = format!("method {}", method.name);
            self.check("type definition", method.owner.0, self.type_defs.len(), &what)?;
            self.check_type(method.return_type, &what)?;
            self.check_generic_params(&method.generic_params, &what)?;
            for param in &method.params {
                self.check("param", param.0, self.params.len(), &what)?;
            }
            if let Some(body) = &method.body {
                let mut checker = BodyChecker {
                    module: self,
                    what: &what,
                    error: None,
                };
                checker.visit_block(body);
                if let Some(error) = checker.error {
                    return Err(error);
                }
            }
        }
        for field in &self.fields {
            let what = format!("field {}", field.name);
            self.check("type definition", field.owner.0, self.type_defs.len(), &what)?;
            self.check_type(field.ty, &what)?;
        }
        for local in &self.locals {
            self.check_type(local.ty, &format!("local {}", local.name))?;
        }
        for param in &self.params {
            self.check_type(param.ty, &format!("param {}", param.name))?;
        }
        Ok(())
    }

    fn check(&self, arena: &'static str, id: u32, len: usize, what: &str) -> Result<(), IrError> {
        if (id as usize) < len {
            Ok(())
        } else {
            Err(IrError::Dangling {
                what: what.to_string(),
                arena,
                id,
            })
        }
    }

    fn check_type(&self, ty: TypeId, what: &str) -> Result<(), IrError> {
        self.check("type", ty.0, self.types.len(), what)
    }

    fn check_method_ref(&self, method: &MethodRef, what: &str) -> Result<(), IrError> {
        self.check("method", method.method.0, self.methods.len(), what)?;
        self.check_type(method.owner, what)?;
        for arg in &method.type_args {
            self.check_type(*arg, what)?;
        }
        Ok(())
    }

    fn check_generic_params(&self, params: &[GenericParam], what: &str) -> Result<(), IrError> {
        for constraint in params.iter().flat_map(|p| &p.constraints) {
            self.check_type(*constraint, what)?;
        }
        Ok(())
    }

    fn check_platform(&self) -> Result<(), IrError> {
        let p = &self.platform;
        let defs = [
            p.object,
            p.thread,
            p.enumerable,
            p.generic_enumerable,
            p.enumerator,
            p.generic_enumerator,
            p.disposable,
        ];
        for def in defs {
            self.check("type definition", def.0, self.type_defs.len(), "platform")?;
        }
        let methods = [
            p.object_ctor,
            p.current_thread,
            p.managed_thread_id,
            p.enumerable_get_enumerator,
            p.generic_enumerable_get_enumerator,
            p.enumerator_get_current,
            p.enumerator_move_next,
            p.enumerator_reset,
            p.generic_enumerator_get_current,
            p.dispose,
        ];
        for method in methods {
            self.check("method", method.0, self.methods.len(), "platform")?;
        }
        Ok(())
    }
}

fn check_positions(arena: &'static str, ids: impl Iterator<Item = u32>) -> Result<(), IrError> {
    for (position, id) in ids.enumerate() {
        if id as usize != position {
            return Err(IrError::MisplacedId {
                arena,
                position,
                id,
            });
        }
    }
    Ok(())
}

struct BodyChecker<'a> {
    module: &'a Module,
    what: &'a str,
    error: Option<IrError>,
}

impl BodyChecker<'_> {
    fn keep(&mut self, result: Result<(), IrError>) {
        if self.error.is_none() {
            if let Err(e) = result {
                self.error = Some(e);
            }
        }
    }

    fn record(&mut self, arena: &'static str, id: u32, len: usize) {
        let result = self.module.check(arena, id, len, self.what);
        self.keep(result);
    }

    fn record_type(&mut self, ty: TypeId) {
        let result = self.module.check_type(ty, self.what);
        self.keep(result);
    }

    fn record_method(&mut self, method: &MethodRef) {
        let result = self.module.check_method_ref(method, self.what);
        self.keep(result);
    }
}

impl Visit for BodyChecker<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let Stmt::Local { local, .. } = stmt {
            self.record("local", local.0, self.module.locals.len());
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        let module = self.module;
        match expr {
            Expr::Const { ty, .. } | Expr::Convert { ty, .. } => self.record_type(*ty),
            Expr::Local(id) => self.record("local", id.0, module.locals.len()),
            Expr::Param(id) => self.record("param", id.0, module.params.len()),
            Expr::Field { field, .. } => {
                self.record("field", field.field.0, module.fields.len());
                self.record_type(field.owner);
            }
            Expr::Call { method, .. } => self.record_method(method),
            Expr::CreateDelegate { method, ty, .. } => {
                self.record_method(method);
                self.record_type(*ty);
            }
            Expr::New { ctor, .. } => self.record_method(ctor),
            Expr::Lambda(lambda) => {
                for param in &lambda.params {
                    self.record("param", param.0, module.params.len());
                }
                self.record_type(lambda.return_type);
                self.record_type(lambda.delegate_type);
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}
