//! Named-object registry
//!
//! Global name -> object map backing `create_object`/`open_handle`.
//! Publication takes the owner's double-counted reference (`manage`);
//! the last `relax` of a named object erases it here before teardown.

use alloc::collections::BTreeMap;
use alloc::string::String;

use lazy_static::lazy_static;

use crate::sync::IrqMutex;

use super::waitable::{KernelObject, ObjPtr};

struct Registry {
    map: BTreeMap<String, ObjPtr>,
}

// Object pointers are only dereferenced while the map lock pins them
// published (erase precedes destruction).
unsafe impl Send for Registry {}

lazy_static! {
    static ref NAMED: IrqMutex<Registry> = IrqMutex::new(Registry {
        map: BTreeMap::new(),
    });
}

/// Publish an object under `name`, taking the registry's own reference via
/// `manage`. Refuses duplicates and empty names.
pub fn publish(name: &str, obj: &'static dyn KernelObject) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut registry = NAMED.lock();
    if registry.map.contains_key(name) {
        return false;
    }
    obj.manage();
    registry.map.insert(String::from(name), ObjPtr::from(obj));
    true
}

/// Resolve a name to an acquired reference.
pub fn open(name: &str) -> Option<ObjPtr> {
    let registry = NAMED.lock();
    let ptr = *registry.map.get(name)?;
    // SAFETY: the map holds a reference, so the object is live while the
    // lock pins the entry.
    unsafe { ptr.as_ref().acquire() }.then_some(ptr)
}

/// Remove a dying object's entry. Called from the object's own last-relax
/// path; absence is fine (anonymous objects).
pub fn erase(name: &str) {
    NAMED.lock().map.remove(name);
}
