//! Closure type synthesis
//!
//! Closure types are created lazily, one per scope that declares captured
//! state. Each one points at the closure of its nearest enclosing scope
//! through an outer field, forming a chain that lowered code walks to reach
//! variables captured further out.

use std::collections::HashMap;

use cinder_ir::{Module, ScopeId, Visibility};
use cinder_types::{FieldId, MethodId, TypeDefId, TypeId};
use log::debug;

use crate::error::Result;
use crate::subst::Substitution;

/// Name of the field holding the captured receiver.
pub const SELF_FIELD: &str = "<>__this";

/// One synthesized closure type
#[derive(Debug, Clone)]
pub struct ClosureRecord {
    pub def: TypeDefId,
    /// Scope whose variables it holds
    pub scope: ScopeId,
    /// Closure of the nearest enclosing scope
    pub parent: Option<usize>,
    pub outer_field: Option<FieldId>,
    pub self_field: Option<FieldId>,
    pub ctor: MethodId,
    /// Name of locals holding an instance, reused for outer fields pointing at it
    pub local_name: String,
    /// Carries fresh copies of the method's type parameters
    pub generic: bool,
}

/// Closure records of one method, indexed in creation order
#[derive(Debug, Clone, Default)]
pub struct ClosureChain {
    records: Vec<ClosureRecord>,
}

impl ClosureChain {
    pub fn get(&self, index: usize) -> &ClosureRecord {
        &self.records[index]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClosureRecord> {
        self.records.iter()
    }

    /// The record itself followed by its ancestors, innermost first.
    pub fn ancestors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(index), move |i| self.records[*i].parent)
    }

    /// Outermost ancestor of a record.
    pub fn root_of(&self, index: usize) -> usize {
        self.ancestors(index).last().unwrap_or(index)
    }

    /// Nesting depth, 0 for a chain root.
    pub fn depth(&self, index: usize) -> usize {
        self.ancestors(index).count() - 1
    }
}

/// Creates closure types and the members placed on them for one method
pub struct ClosureSynthesizer {
    method: MethodId,
    method_name: String,
    containing: TypeDefId,
    generic_method: bool,
    chain: ClosureChain,
    /// Mapping from the method's type parameters onto each generic chain root
    root_substs: HashMap<usize, Substitution>,
    method_count: u32,
    types: Vec<TypeDefId>,
}

impl ClosureSynthesizer {
    pub fn new(module: &Module, method: MethodId) -> Self {
        let m = module.method(method);
        Self {
            method,
            method_name: m.name.clone(),
            containing: m.owner,
            generic_method: !m.generic_params.is_empty(),
            chain: ClosureChain::default(),
            root_substs: HashMap::new(),
            method_count: 0,
            types: Vec::new(),
        }
    }

    pub fn chain(&self) -> &ClosureChain {
        &self.chain
    }

    /// Synthesized types, in creation order.
    pub fn into_types(self) -> Vec<TypeDefId> {
        self.types
    }

    /// Create the closure type for `scope`, nested under `parent`'s closure.
    pub fn create(
        &mut self,
        module: &mut Module,
        scope: ScopeId,
        parent: Option<usize>,
    ) -> Result<usize> {
        let index = self.chain.len();
        let number = index + 1;
        let generic = parent.is_none() && self.generic_method;

        // Deeper closures of a generic chain use the root's type parameters,
        // so they live inside the root.
        let declaring = match parent {
            Some(p) if self.chain.get(self.chain.root_of(p)).generic => {
                self.chain.get(self.chain.root_of(p)).def
            }
            _ => self.containing,
        };
        let def = module.add_type_def(
            format!("<{}>c__DisplayClass{}", self.method_name, number),
            None,
            Some(declaring),
        );
        {
            let td = module.type_def_mut(def);
            td.sealed = true;
            td.compiler_generated = true;
            td.visibility = Visibility::Private;
        }

        if generic {
            let subst = Substitution::onto_type(module, self.method, def);
            let params = subst.duplicate_params(module, |p| format!("{}_", p.name))?;
            module.type_def_mut(def).generic_params = params;
            self.root_substs.insert(index, subst);
        }

        let ctor = module.add_default_constructor(def);
        module.method_mut(ctor).compiler_generated = true;

        self.chain.records.push(ClosureRecord {
            def,
            scope,
            parent,
            outer_field: None,
            self_field: None,
            ctor,
            local_name: format!("CS$<>8__locals{}", number),
            generic,
        });

        if let Some(p) = parent {
            let args = self.inside_args(module, index);
            let outer_ty = self.closure_type(module, p, &args);
            let name = self.chain.get(p).local_name.clone();
            let field = module.add_field(def, name, outer_ty);
            self.chain.records[index].outer_field = Some(field);
        }

        self.types.push(def);
        debug!(
            "closure type {} for scope {} (depth {})",
            module.type_def(def).name,
            scope.0,
            self.chain.depth(index)
        );
        Ok(index)
    }

    /// Add a field for a captured variable; `ty` is its type in the original method.
    pub fn add_capture(
        &mut self,
        module: &mut Module,
        record: usize,
        name: &str,
        ty: TypeId,
    ) -> Result<FieldId> {
        let ty = match self.inside(record) {
            Some(subst) => subst.apply(&mut module.types, ty)?,
            None => ty,
        };
        let def = self.chain.get(record).def;
        Ok(module.add_field(def, name, ty))
    }

    /// Add the field holding the method's receiver.
    pub fn add_self_field(&mut self, module: &mut Module, record: usize) -> FieldId {
        let ty = module.self_type(self.containing);
        let field = module.add_field(self.chain.get(record).def, SELF_FIELD, ty);
        self.chain.records[record].self_field = Some(field);
        field
    }

    /// Add an instance method onto a closure type.
    pub fn add_method(&mut self, module: &mut Module, record: usize, return_type: TypeId) -> MethodId {
        self.method_count += 1;
        let name = format!("<{}>b__{}", self.method_name, self.method_count);
        let method = module.add_method(self.chain.get(record).def, name, return_type, false);
        module.method_mut(method).compiler_generated = true;
        debug!(
            "closure method {} on {}",
            module.method(method).name,
            module.type_def(self.chain.get(record).def).name
        );
        method
    }

    /// Substitution from the original method into code running inside `record`.
    pub fn inside(&self, record: usize) -> Option<&Substitution> {
        self.root_substs.get(&self.chain.root_of(record))
    }

    /// Type arguments standing for the method's parameters inside `record`.
    fn inside_args(&self, module: &mut Module, record: usize) -> Vec<TypeId> {
        match self.inside(record) {
            Some(subst) => subst.targets().to_vec(),
            None => module.method_type_params(self.method),
        }
    }

    /// `record`'s type as seen from code where the method's type parameters are `args`.
    pub fn closure_type(&self, module: &mut Module, record: usize, args: &[TypeId]) -> TypeId {
        let r = self.chain.get(record);
        if r.generic {
            module.types.instance(r.def, args.to_vec())
        } else {
            module.types.def(r.def)
        }
    }
}
