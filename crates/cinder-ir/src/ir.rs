//! IR definitions
//!
//! A [`Module`] owns every definition in flat arenas indexed by the id types
//! from `cinder_types`. Method bodies are trees of [`Stmt`] and [`Expr`] that
//! refer back to those arenas by id, never by name.

use cinder_types::{
    FieldId, GenericParam, LabelId, LocalId, MethodId, ParamId, TypeDefId, TypeId, TypeKind,
    TypeTable,
};
use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// Lexical scope identifier, assigned to blocks before analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub u32);

/// Anonymous function identifier, assigned before analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FnId(pub u32);

/// Member accessibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Public,
    Internal,
    Private,
}

/// Kind of a type definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDefKind {
    #[default]
    Class,
    Struct,
    Interface,
}

/// A complete module: every type, member and variable in one compilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Interned types
    pub types: TypeTable,
    /// Type definitions (platform types first)
    pub type_defs: Vec<TypeDef>,
    /// Method definitions
    pub methods: Vec<Method>,
    /// Field definitions
    pub fields: Vec<Field>,
    /// Local variable definitions
    pub locals: Vec<Local>,
    /// Parameter definitions
    pub params: Vec<Param>,
    /// Well-known platform definitions
    pub platform: Platform,
    /// Next free jump target
    #[serde(default)]
    pub next_label: u32,
}

/// A nominal type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub id: TypeDefId,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kind: TypeDefKind,
    /// Enclosing type for nested types
    #[serde(default)]
    pub declaring: Option<TypeDefId>,
    #[serde(default)]
    pub generic_params: Vec<GenericParam>,
    #[serde(default)]
    pub base: Option<TypeId>,
    #[serde(default)]
    pub interfaces: Vec<TypeId>,
    #[serde(default)]
    pub fields: Vec<FieldId>,
    #[serde(default)]
    pub methods: Vec<MethodId>,
    #[serde(default)]
    pub nested: Vec<TypeDefId>,
    /// Explicit interface implementation bindings
    #[serde(default)]
    pub method_impls: Vec<MethodImpl>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub sealed: bool,
    #[serde(default)]
    pub compiler_generated: bool,
    /// Defined outside this module (no bodies)
    #[serde(default)]
    pub external: bool,
}

/// A method definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    pub id: MethodId,
    pub name: String,
    pub owner: TypeDefId,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_constructor: bool,
    /// Accessor or operator (`get_Current`, `.ctor`)
    #[serde(default)]
    pub special_name: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub generic_params: Vec<GenericParam>,
    #[serde(default)]
    pub params: Vec<ParamId>,
    pub return_type: TypeId,
    #[serde(default)]
    pub body: Option<Block>,
    #[serde(default)]
    pub compiler_generated: bool,
}

/// A field definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    pub ty: TypeId,
    pub owner: TypeDefId,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub compiler_generated: bool,
}

/// A local variable definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Local {
    pub id: LocalId,
    pub name: String,
    pub ty: TypeId,
}

/// A parameter definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub id: ParamId,
    pub name: String,
    pub ty: TypeId,
}

/// Binds a method of a type to the interface member it implements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodImpl {
    pub implementing: MethodRef,
    pub implemented: MethodRef,
}

/// A method as used at a particular instantiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub method: MethodId,
    /// Declaring type, instantiated as seen from the use site
    pub owner: TypeId,
    /// Method type arguments (empty for non-generic methods)
    #[serde(default)]
    pub type_args: Vec<TypeId>,
}

/// A field as used at a particular instantiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub field: FieldId,
    pub owner: TypeId,
}

/// A lexical block of statements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub scope: ScopeId,
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self {
            scope: ScopeId::default(),
            stmts,
        }
    }
}

/// One arm of a `Switch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: i32,
    pub body: Vec<Stmt>,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Nested lexical block
    Block(Block),
    /// Local declaration with optional initializer
    Local { local: LocalId, init: Option<Expr> },
    /// Expression statement
    Expr(Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    While { cond: Expr, body: Block },
    /// Jump target
    Label(LabelId),
    Goto(LabelId),
    /// Integer dispatch
    Switch {
        value: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    /// Suspend point producing a value
    YieldReturn(Expr),
    /// Suspend point ending the sequence
    YieldBreak,
    Empty,
}

/// Compile-time constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const { value: Constant, ty: TypeId },
    /// Read of a local variable
    Local(LocalId),
    /// Read of a parameter
    Param(ParamId),
    /// The implicit receiver
    This,
    /// Field access; `target` is `None` for static fields
    Field {
        target: Option<Box<Expr>>,
        field: FieldRef,
    },
    /// Assignment to a local, parameter or field
    Assign { target: Box<Expr>, value: Box<Expr> },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    Call {
        method: MethodRef,
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    /// Object construction through a constructor
    New { ctor: MethodRef, args: Vec<Expr> },
    /// Call through a delegate value
    Invoke { delegate: Box<Expr>, args: Vec<Expr> },
    /// Bound method pointer construction
    CreateDelegate {
        method: MethodRef,
        receiver: Option<Box<Expr>>,
        ty: TypeId,
    },
    /// Conversion, boxing when the source is a value type
    Convert { value: Box<Expr>, ty: TypeId },
    /// Anonymous function (input trees only)
    Lambda(Box<AnonymousFunction>),
    /// Statements evaluated before producing a value
    Sequence { stmts: Vec<Stmt>, value: Box<Expr> },
}

/// An anonymous function expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymousFunction {
    #[serde(default)]
    pub id: FnId,
    pub params: Vec<ParamId>,
    pub return_type: TypeId,
    /// Delegate type the function converts to
    pub delegate_type: TypeId,
    pub body: Block,
}

impl Module {
    /// Create an empty module with the platform definitions installed.
    pub fn new(name: impl Into<String>) -> Self {
        let mut module = Self {
            name: name.into(),
            types: TypeTable::new(),
            type_defs: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            locals: Vec::new(),
            params: Vec::new(),
            platform: Platform::placeholder(),
            next_label: 0,
        };
        module.platform = Platform::install(&mut module);
        module
    }

    pub fn type_def(&self, id: TypeDefId) -> &TypeDef {
        &self.type_defs[id.index()]
    }

    pub fn type_def_mut(&mut self, id: TypeDefId) -> &mut TypeDef {
        &mut self.type_defs[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.index()]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.index()]
    }

    pub fn local(&self, id: LocalId) -> &Local {
        &self.locals[id.index()]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut Local {
        &mut self.locals[id.index()]
    }

    pub fn param(&self, id: ParamId) -> &Param {
        &self.params[id.index()]
    }

    pub fn param_mut(&mut self, id: ParamId) -> &mut Param {
        &mut self.params[id.index()]
    }

    /// Add a type definition; a nested type is registered with its declaring type.
    pub fn add_type_def(
        &mut self,
        name: impl Into<String>,
        namespace: Option<String>,
        declaring: Option<TypeDefId>,
    ) -> TypeDefId {
        let id = TypeDefId(self.type_defs.len() as u32);
        let base = Some(self.types.def(self.platform.object));
        self.type_defs.push(TypeDef {
            id,
            name: name.into(),
            namespace,
            kind: TypeDefKind::Class,
            declaring,
            generic_params: Vec::new(),
            base,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            nested: Vec::new(),
            method_impls: Vec::new(),
            visibility: Visibility::Public,
            sealed: false,
            compiler_generated: false,
            external: false,
        });
        if let Some(outer) = declaring {
            self.type_def_mut(outer).nested.push(id);
        }
        id
    }

    /// Add a method without parameters or body to `owner`.
    pub fn add_method(
        &mut self,
        owner: TypeDefId,
        name: impl Into<String>,
        return_type: TypeId,
        is_static: bool,
    ) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(Method {
            id,
            name: name.into(),
            owner,
            is_static,
            is_virtual: false,
            is_constructor: false,
            special_name: false,
            visibility: Visibility::Public,
            generic_params: Vec::new(),
            params: Vec::new(),
            return_type,
            body: None,
            compiler_generated: false,
        });
        self.type_def_mut(owner).methods.push(id);
        id
    }

    pub fn add_field(&mut self, owner: TypeDefId, name: impl Into<String>, ty: TypeId) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(Field {
            id,
            name: name.into(),
            ty,
            owner,
            is_static: false,
            visibility: Visibility::Public,
            compiler_generated: false,
        });
        self.type_def_mut(owner).fields.push(id);
        id
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: TypeId) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(Local {
            id,
            name: name.into(),
            ty,
        });
        id
    }

    /// Add a parameter definition (not attached to any signature yet).
    pub fn add_param(&mut self, name: impl Into<String>, ty: TypeId) -> ParamId {
        let id = ParamId(self.params.len() as u32);
        self.params.push(Param {
            id,
            name: name.into(),
            ty,
        });
        id
    }

    /// Add a parameter at the end of a method signature.
    pub fn push_param(&mut self, method: MethodId, name: impl Into<String>, ty: TypeId) -> ParamId {
        let id = self.add_param(name, ty);
        self.method_mut(method).params.push(id);
        id
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    /// The type a definition uses to refer to itself: instantiated over its
    /// own type parameters when generic.
    pub fn self_type(&mut self, def: TypeDefId) -> TypeId {
        let count = self.type_def(def).generic_params.len();
        let args = (0..count)
            .map(|i| self.types.type_param(def, i as u16))
            .collect();
        self.types.instance(def, args)
    }

    /// The method's own type parameters, in order.
    pub fn method_type_params(&mut self, method: MethodId) -> Vec<TypeId> {
        let count = self.method(method).generic_params.len();
        (0..count)
            .map(|i| self.types.method_param(method, i as u16))
            .collect()
    }

    /// Reference to a method of a non-generic or self-instantiated owner.
    pub fn method_ref(&mut self, method: MethodId) -> MethodRef {
        let owner = self.self_type(self.method(method).owner);
        MethodRef {
            method,
            owner,
            type_args: Vec::new(),
        }
    }

    /// Reference to a field through its owner's self instance.
    pub fn field_ref(&mut self, field: FieldId) -> FieldRef {
        let owner = self.self_type(self.field(field).owner);
        FieldRef { field, owner }
    }

    /// Check if values of `ty` are object references (no boxing needed).
    pub fn is_reference_type(&self, ty: TypeId) -> bool {
        match self.types.kind(ty) {
            TypeKind::String | TypeKind::Array(_) | TypeKind::Delegate { .. } => true,
            TypeKind::Def(def) | TypeKind::Instance { def, .. } => {
                self.type_def(*def).kind != TypeDefKind::Struct
            }
            TypeKind::TypeParam { owner, index } => self
                .type_def(*owner)
                .generic_params
                .get(*index as usize)
                .map_or(false, |p| p.reference_type),
            TypeKind::MethodParam { owner, index } => self
                .method(*owner)
                .generic_params
                .get(*index as usize)
                .map_or(false, |p| p.reference_type),
            _ => false,
        }
    }

    /// Methods with bodies, in definition order.
    pub fn methods_with_bodies(&self) -> Vec<MethodId> {
        self.methods
            .iter()
            .filter(|m| m.body.is_some())
            .map(|m| m.id)
            .collect()
    }

    /// Find a method of `owner` by name.
    pub fn find_method(&self, owner: TypeDefId, name: &str) -> Option<MethodId> {
        self.type_def(owner)
            .methods
            .iter()
            .copied()
            .find(|m| self.method(*m).name == name)
    }

    /// Find a field of `owner` by name.
    pub fn find_field(&self, owner: TypeDefId, name: &str) -> Option<FieldId> {
        self.type_def(owner)
            .fields
            .iter()
            .copied()
            .find(|f| self.field(*f).name == name)
    }
}
