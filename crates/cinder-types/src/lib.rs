//! Type system for cinder
//!
//! Types are interned into a [`TypeTable`]: structurally equal kinds always
//! resolve to the same [`TypeId`], so the lowering passes can key maps on
//! type identity instead of comparing structures or names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Position of this id in its owning arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

define_id!(
    /// Interned type handle
    TypeId
);
define_id!(
    /// Unique identifier for type definitions
    TypeDefId
);
define_id!(
    /// Unique identifier for methods
    MethodId
);
define_id!(
    /// Unique identifier for fields
    FieldId
);
define_id!(
    /// Unique identifier for local variables
    LocalId
);
define_id!(
    /// Unique identifier for parameters
    ParamId
);
define_id!(
    /// Unique identifier for jump targets
    LabelId
);

/// Core type representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// No value
    Void,
    /// Boolean
    Bool,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 64-bit float
    Float64,
    /// UTF-16 code unit
    Char,
    /// Immutable string (a reference type)
    String,
    /// A nominal type definition used without type arguments
    Def(TypeDefId),
    /// A generic type definition instantiated with arguments
    Instance { def: TypeDefId, args: Vec<TypeId> },
    /// The `index`-th type parameter of a generic type definition
    TypeParam { owner: TypeDefId, index: u16 },
    /// The `index`-th type parameter of a generic method
    MethodParam { owner: MethodId, index: u16 },
    /// Single-dimensional array
    Array(TypeId),
    /// Bound method pointer type
    Delegate { params: Vec<TypeId>, ret: TypeId },
}

impl TypeKind {
    /// Type ids directly referenced by this kind.
    pub fn children(&self) -> Vec<TypeId> {
        match self {
            TypeKind::Instance { args, .. } => args.clone(),
            TypeKind::Array(elem) => vec![*elem],
            TypeKind::Delegate { params, ret } => {
                let mut ids = params.clone();
                ids.push(*ret);
                ids
            }
            _ => Vec::new(),
        }
    }
}

/// Generic parameter definition (on a type or a method)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericParam {
    /// Name of the parameter (e.g., "T")
    pub name: String,
    /// Types the argument must derive from or implement
    #[serde(default)]
    pub constraints: Vec<TypeId>,
    /// `class` constraint
    #[serde(default)]
    pub reference_type: bool,
    /// `struct` constraint
    #[serde(default)]
    pub value_type: bool,
    /// `new()` constraint
    #[serde(default)]
    pub default_constructor: bool,
}

impl GenericParam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: Vec::new(),
            reference_type: false,
            value_type: false,
            default_constructor: false,
        }
    }

    /// Copy the flags of this parameter under a new name, with the given constraints.
    pub fn duplicate(&self, name: impl Into<String>, constraints: Vec<TypeId>) -> Self {
        Self {
            name: name.into(),
            constraints,
            reference_type: self.reference_type,
            value_type: self.value_type,
            default_constructor: self.default_constructor,
        }
    }
}

/// Errors raised when a serialized type table is inconsistent
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("type {ty} refers to {referenced}, which is not defined before it")]
    DanglingReference { ty: TypeId, referenced: TypeId },
    #[error("type kind {0:?} is interned twice")]
    Duplicate(TypeKind),
}

/// Interning table for types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<TypeKind>", into = "Vec<TypeKind>")]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    index: HashMap<TypeKind, TypeId>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// Create a table with the primitive types pre-interned.
    pub fn new() -> Self {
        let mut table = Self {
            kinds: Vec::new(),
            index: HashMap::new(),
        };
        for kind in [
            TypeKind::Void,
            TypeKind::Bool,
            TypeKind::Int32,
            TypeKind::Int64,
            TypeKind::Float64,
            TypeKind::Char,
            TypeKind::String,
        ] {
            table.intern(kind);
        }
        table
    }

    /// Get the id for a kind, adding it to the table if needed.
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.index.get(&kind) {
            return *id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.index.insert(kind, id);
        id
    }

    /// Look up a kind without interning it.
    pub fn lookup(&self, kind: &TypeKind) -> Option<TypeId> {
        self.index.get(kind).copied()
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.kinds[id.index()]
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeKind)> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| (TypeId(i as u32), kind))
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    pub fn bool(&mut self) -> TypeId {
        self.intern(TypeKind::Bool)
    }

    pub fn int32(&mut self) -> TypeId {
        self.intern(TypeKind::Int32)
    }

    pub fn string(&mut self) -> TypeId {
        self.intern(TypeKind::String)
    }

    pub fn def(&mut self, def: TypeDefId) -> TypeId {
        self.intern(TypeKind::Def(def))
    }

    pub fn instance(&mut self, def: TypeDefId, args: Vec<TypeId>) -> TypeId {
        if args.is_empty() {
            return self.def(def);
        }
        self.intern(TypeKind::Instance { def, args })
    }

    pub fn type_param(&mut self, owner: TypeDefId, index: u16) -> TypeId {
        self.intern(TypeKind::TypeParam { owner, index })
    }

    pub fn method_param(&mut self, owner: MethodId, index: u16) -> TypeId {
        self.intern(TypeKind::MethodParam { owner, index })
    }

    pub fn array(&mut self, elem: TypeId) -> TypeId {
        self.intern(TypeKind::Array(elem))
    }

    pub fn delegate(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        self.intern(TypeKind::Delegate { params, ret })
    }

    /// Check if `id` mentions any method type parameter.
    pub fn mentions_method_param(&self, id: TypeId) -> bool {
        match self.kind(id) {
            TypeKind::MethodParam { .. } => true,
            kind => kind
                .children()
                .into_iter()
                .any(|child| self.mentions_method_param(child)),
        }
    }

    /// Rebuild a type bottom-up.
    ///
    /// `leaf` is consulted on every node first; returning `Some` replaces the
    /// node outright. Otherwise composite kinds are rebuilt from their
    /// rewritten children and re-interned.
    pub fn try_rewrite<E>(
        &mut self,
        id: TypeId,
        leaf: &mut dyn FnMut(&TypeKind) -> Result<Option<TypeId>, E>,
    ) -> Result<TypeId, E> {
        let kind = self.kind(id).clone();
        if let Some(replacement) = leaf(&kind)? {
            return Ok(replacement);
        }
        let rebuilt = match kind {
            TypeKind::Instance { def, args } => {
                let mut new_args = Vec::with_capacity(args.len());
                for arg in args {
                    new_args.push(self.try_rewrite(arg, leaf)?);
                }
                TypeKind::Instance {
                    def,
                    args: new_args,
                }
            }
            TypeKind::Array(elem) => TypeKind::Array(self.try_rewrite(elem, leaf)?),
            TypeKind::Delegate { params, ret } => {
                let mut new_params = Vec::with_capacity(params.len());
                for param in params {
                    new_params.push(self.try_rewrite(param, leaf)?);
                }
                TypeKind::Delegate {
                    params: new_params,
                    ret: self.try_rewrite(ret, leaf)?,
                }
            }
            // Leaves without a replacement stay as they are
            _ => return Ok(id),
        };
        Ok(self.intern(rebuilt))
    }
}

impl TryFrom<Vec<TypeKind>> for TypeTable {
    type Error = TypeError;

    fn try_from(kinds: Vec<TypeKind>) -> Result<Self, Self::Error> {
        let mut index = HashMap::with_capacity(kinds.len());
        for (i, kind) in kinds.iter().enumerate() {
            let id = TypeId(i as u32);
            for child in kind.children() {
                if child.index() >= i {
                    return Err(TypeError::DanglingReference {
                        ty: id,
                        referenced: child,
                    });
                }
            }
            if index.insert(kind.clone(), id).is_some() {
                return Err(TypeError::Duplicate(kind.clone()));
            }
        }
        Ok(Self { kinds, index })
    }
}

impl From<TypeTable> for Vec<TypeKind> {
    fn from(table: TypeTable) -> Self {
        table.kinds
    }
}
