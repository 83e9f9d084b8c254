//! Thread binding of hierarchies
//!
//! Each thread keeps at most one hierarchy per engine instance. Entries are
//! removed as soon as their hierarchy completes or is discarded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::hierarchy::SharedHierarchy;

thread_local! {
    static HIERARCHIES: RefCell<HashMap<u64, Rc<SharedHierarchy>>> = RefCell::new(HashMap::new());
}

/// The calling thread's hierarchy for `engine_id`, if any
pub(crate) fn current(engine_id: u64) -> Option<Rc<SharedHierarchy>> {
    HIERARCHIES
        .try_with(|map| map.borrow().get(&engine_id).cloned())
        .ok()
        .flatten()
}

pub(crate) fn install(hierarchy: Rc<SharedHierarchy>) {
    let _ = HIERARCHIES.try_with(|map| {
        map.borrow_mut().insert(hierarchy.engine_id, hierarchy);
    });
}

/// Unregister `hierarchy` if it is still the current one for its engine
pub(crate) fn release(hierarchy: &Rc<SharedHierarchy>) {
    let _ = HIERARCHIES.try_with(|map| {
        let mut map = map.borrow_mut();
        let is_current = map
            .get(&hierarchy.engine_id)
            .map(|h| Rc::ptr_eq(h, hierarchy))
            .unwrap_or(false);
        if is_current {
            map.remove(&hierarchy.engine_id);
        }
    });
}
