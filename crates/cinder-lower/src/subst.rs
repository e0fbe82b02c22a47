//! Generic parameter substitution
//!
//! Code moved out of a generic method keeps referring to the method's type
//! parameters. A [`Substitution`] rewrites those references into whatever
//! stands for them in the new home: the type parameters of a synthesized
//! type, or the copied parameters of a synthesized generic method.

use cinder_ir::{Expr, FieldRef, Module, MethodRef};
use cinder_types::{GenericParam, MethodId, TypeId, TypeKind, TypeTable};

use crate::error::{LowerError, Result};

#[derive(Debug, Clone)]
pub struct Substitution {
    method: MethodId,
    method_name: String,
    targets: Vec<TypeId>,
    identity: bool,
}

impl Substitution {
    /// Leaves the method's own parameters in place.
    pub fn identity(module: &mut Module, method: MethodId) -> Self {
        let targets = module.method_type_params(method);
        Self {
            method,
            method_name: qualified_name(module, method),
            targets,
            identity: true,
        }
    }

    /// Maps parameter `i` of `method` to the given types, in order.
    pub fn new(module: &Module, method: MethodId, targets: Vec<TypeId>) -> Self {
        Self {
            method,
            method_name: qualified_name(module, method),
            targets,
            identity: false,
        }
    }

    /// Maps parameter `i` of `method` to parameter `i` of `def`.
    pub fn onto_type(module: &mut Module, method: MethodId, def: cinder_types::TypeDefId) -> Self {
        let count = module.method(method).generic_params.len();
        let targets = (0..count)
            .map(|i| module.types.type_param(def, i as u16))
            .collect();
        Self::new(module, method, targets)
    }

    /// Maps parameter `i` of `method` to parameter `i` of `target`.
    pub fn onto_method(module: &mut Module, method: MethodId, target: MethodId) -> Self {
        let count = module.method(method).generic_params.len();
        let targets = (0..count)
            .map(|i| module.types.method_param(target, i as u16))
            .collect();
        Self::new(module, method, targets)
    }

    /// What each of the method's type parameters becomes.
    pub fn targets(&self) -> &[TypeId] {
        &self.targets
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn apply(&self, types: &mut TypeTable, ty: TypeId) -> Result<TypeId> {
        if self.identity || !types.mentions_method_param(ty) {
            return Ok(ty);
        }
        let method = self.method;
        let targets = &self.targets;
        let method_name = &self.method_name;
        types.try_rewrite(ty, &mut |kind| match kind {
            TypeKind::MethodParam { owner, index } if *owner == method => targets
                .get(*index as usize)
                .copied()
                .map(Some)
                .ok_or_else(|| foreign(method_name, *owner, *index)),
            TypeKind::MethodParam { owner, index } => Err(foreign(method_name, *owner, *index)),
            _ => Ok(None),
        })
    }

    pub fn apply_all(&self, types: &mut TypeTable, tys: &[TypeId]) -> Result<Vec<TypeId>> {
        tys.iter().map(|ty| self.apply(types, *ty)).collect()
    }

    pub fn apply_method_ref(&self, types: &mut TypeTable, method: &MethodRef) -> Result<MethodRef> {
        Ok(MethodRef {
            method: method.method,
            owner: self.apply(types, method.owner)?,
            type_args: self.apply_all(types, &method.type_args)?,
        })
    }

    pub fn apply_field_ref(&self, types: &mut TypeTable, field: FieldRef) -> Result<FieldRef> {
        Ok(FieldRef {
            field: field.field,
            owner: self.apply(types, field.owner)?,
        })
    }

    /// Rewrite the types held directly by `expr`; children are left to the caller's traversal.
    pub fn apply_to_node(&self, types: &mut TypeTable, expr: &mut Expr) -> Result<()> {
        if self.identity {
            return Ok(());
        }
        match expr {
            Expr::Const { ty, .. } | Expr::Convert { ty, .. } => *ty = self.apply(types, *ty)?,
            Expr::Field { field, .. } => *field = self.apply_field_ref(types, *field)?,
            Expr::Call { method, .. } => *method = self.apply_method_ref(types, method)?,
            Expr::New { ctor, .. } => *ctor = self.apply_method_ref(types, ctor)?,
            Expr::CreateDelegate { method, ty, .. } => {
                *method = self.apply_method_ref(types, method)?;
                *ty = self.apply(types, *ty)?;
            }
            Expr::Lambda(lambda) => {
                lambda.return_type = self.apply(types, lambda.return_type)?;
                lambda.delegate_type = self.apply(types, lambda.delegate_type)?;
            }
            Expr::Local(_)
            | Expr::Param(_)
            | Expr::This
            | Expr::Assign { .. }
            | Expr::Binary { .. }
            | Expr::Not(_)
            | Expr::Invoke { .. }
            | Expr::Sequence { .. } => {}
        }
        Ok(())
    }

    /// Copy the method's generic parameters for a new owner, renaming each with
    /// `rename` and rewriting constraints that mention other parameters.
    pub fn duplicate_params(
        &self,
        module: &mut Module,
        rename: impl Fn(&GenericParam) -> String,
    ) -> Result<Vec<GenericParam>> {
        let params = module.method(self.method).generic_params.clone();
        let mut copies = Vec::with_capacity(params.len());
        for param in &params {
            let constraints = self.apply_all(&mut module.types, &param.constraints)?;
            copies.push(param.duplicate(rename(param), constraints));
        }
        Ok(copies)
    }
}

/// `Owner::Name` for diagnostics.
pub fn qualified_name(module: &Module, method: MethodId) -> String {
    let m = module.method(method);
    format!("{}::{}", module.type_def(m.owner).name, m.name)
}

fn foreign(method_name: &str, owner: MethodId, index: u16) -> LowerError {
    LowerError::ForeignGenericParameter {
        method: method_name.to_string(),
        param: format!("!!{} of {}", index, owner),
    }
}
