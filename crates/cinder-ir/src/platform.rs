//! Platform types and members the lowering passes bind to

use cinder_types::{GenericParam, MethodId, TypeDefId};
use serde::{Deserialize, Serialize};

use crate::ir::{Module, TypeDefKind};

/// Well-known definitions installed into every module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// `System.Object`
    pub object: TypeDefId,
    /// `System.Object..ctor()`
    pub object_ctor: MethodId,
    /// `System.Threading.Thread`
    pub thread: TypeDefId,
    /// `Thread.get_CurrentThread()` (static)
    pub current_thread: MethodId,
    /// `Thread.get_ManagedThreadId()`
    pub managed_thread_id: MethodId,
    /// `System.Collections.IEnumerable`
    pub enumerable: TypeDefId,
    pub enumerable_get_enumerator: MethodId,
    /// `System.Collections.Generic.IEnumerable<T>`
    pub generic_enumerable: TypeDefId,
    pub generic_enumerable_get_enumerator: MethodId,
    /// `System.Collections.IEnumerator`
    pub enumerator: TypeDefId,
    pub enumerator_get_current: MethodId,
    pub enumerator_move_next: MethodId,
    pub enumerator_reset: MethodId,
    /// `System.Collections.Generic.IEnumerator<T>`
    pub generic_enumerator: TypeDefId,
    pub generic_enumerator_get_current: MethodId,
    /// `System.IDisposable`
    pub disposable: TypeDefId,
    pub dispose: MethodId,
}

impl Platform {
    /// Ids used while the platform is being installed.
    pub(crate) fn placeholder() -> Self {
        Self {
            object: TypeDefId(0),
            object_ctor: MethodId(0),
            thread: TypeDefId(0),
            current_thread: MethodId(0),
            managed_thread_id: MethodId(0),
            enumerable: TypeDefId(0),
            enumerable_get_enumerator: MethodId(0),
            generic_enumerable: TypeDefId(0),
            generic_enumerable_get_enumerator: MethodId(0),
            enumerator: TypeDefId(0),
            enumerator_get_current: MethodId(0),
            enumerator_move_next: MethodId(0),
            enumerator_reset: MethodId(0),
            generic_enumerator: TypeDefId(0),
            generic_enumerator_get_current: MethodId(0),
            disposable: TypeDefId(0),
            dispose: MethodId(0),
        }
    }

    /// Add the platform definitions to a fresh module.
    pub(crate) fn install(module: &mut Module) -> Self {
        let system = Some("System".to_string());
        let collections = Some("System.Collections".to_string());
        let generic = Some("System.Collections.Generic".to_string());

        let object = external(module, "Object", system.clone(), TypeDefKind::Class);
        module.type_def_mut(object).base = None;
        let void = module.types.void();
        let object_ctor = module.add_method(object, ".ctor", void, false);
        mark_constructor(module, object_ctor);

        let thread = external(
            module,
            "Thread",
            Some("System.Threading".to_string()),
            TypeDefKind::Class,
        );
        let thread_ty = module.types.def(thread);
        let int32 = module.types.int32();
        let boolean = module.types.bool();
        let current_thread = module.add_method(thread, "get_CurrentThread", thread_ty, true);
        let managed_thread_id = module.add_method(thread, "get_ManagedThreadId", int32, false);
        module.method_mut(current_thread).special_name = true;
        module.method_mut(managed_thread_id).special_name = true;

        let object_ty = module.types.def(object);

        let enumerator = external(module, "IEnumerator", collections.clone(), TypeDefKind::Interface);
        let enumerator_ty = module.types.def(enumerator);
        let enumerator_get_current = interface_method(module, enumerator, "get_Current", object_ty);
        module.method_mut(enumerator_get_current).special_name = true;
        let enumerator_move_next = interface_method(module, enumerator, "MoveNext", boolean);
        let enumerator_reset = interface_method(module, enumerator, "Reset", void);

        let enumerable = external(module, "IEnumerable", collections, TypeDefKind::Interface);
        let enumerable_get_enumerator =
            interface_method(module, enumerable, "GetEnumerator", enumerator_ty);

        let disposable = external(module, "IDisposable", system, TypeDefKind::Interface);
        let dispose = interface_method(module, disposable, "Dispose", void);

        let generic_enumerator =
            external(module, "IEnumerator`1", generic.clone(), TypeDefKind::Interface);
        module.type_def_mut(generic_enumerator).generic_params = vec![GenericParam::new("T")];
        let t = module.types.type_param(generic_enumerator, 0);
        let generic_enumerator_get_current =
            interface_method(module, generic_enumerator, "get_Current", t);
        module.method_mut(generic_enumerator_get_current).special_name = true;

        let generic_enumerable =
            external(module, "IEnumerable`1", generic, TypeDefKind::Interface);
        module.type_def_mut(generic_enumerable).generic_params = vec![GenericParam::new("T")];
        let t = module.types.type_param(generic_enumerable, 0);
        let enumerator_of_t = module.types.instance(generic_enumerator, vec![t]);
        let generic_enumerable_get_enumerator =
            interface_method(module, generic_enumerable, "GetEnumerator", enumerator_of_t);

        Self {
            object,
            object_ctor,
            thread,
            current_thread,
            managed_thread_id,
            enumerable,
            enumerable_get_enumerator,
            generic_enumerable,
            generic_enumerable_get_enumerator,
            enumerator,
            enumerator_get_current,
            enumerator_move_next,
            enumerator_reset,
            generic_enumerator,
            generic_enumerator_get_current,
            disposable,
            dispose,
        }
    }
}

fn external(
    module: &mut Module,
    name: &str,
    namespace: Option<String>,
    kind: TypeDefKind,
) -> TypeDefId {
    let id = module.add_type_def(name, namespace, None);
    let def = module.type_def_mut(id);
    def.kind = kind;
    def.external = true;
    if kind == TypeDefKind::Interface {
        def.base = None;
    }
    id
}

fn interface_method(
    module: &mut Module,
    owner: TypeDefId,
    name: &str,
    return_type: cinder_types::TypeId,
) -> MethodId {
    let id = module.add_method(owner, name, return_type, false);
    module.method_mut(id).is_virtual = true;
    id
}

pub(crate) fn mark_constructor(module: &mut Module, method: MethodId) {
    let m = module.method_mut(method);
    m.is_constructor = true;
    m.special_name = true;
}
