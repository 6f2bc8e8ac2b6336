//! Change list computation between current and desired authorization state

use std::collections::{HashMap, HashSet};

use crate::auth_object::{AuthObject, ChangeItem, ErrorHandler, Operation};

/// Compute the operations that turn `current` into `desired`
///
/// - desired but not current: `Add`
/// - both, payload differs: `Update`, carrying the current metadata so the
///   write is conditional on the version that was read
/// - current but not desired: `Delete`
///
/// Adds and updates come first in desired order, then deletes in current
/// order. Equal payloads produce nothing, so diffing a state against itself
/// yields an empty list.
pub fn diff(
    current: &[AuthObject],
    desired: &[AuthObject],
    on_error: ErrorHandler,
) -> Vec<ChangeItem> {
    let current_by_key: HashMap<String, &AuthObject> =
        current.iter().map(|obj| (obj.key(), obj)).collect();
    let desired_keys: HashSet<String> = desired.iter().map(AuthObject::key).collect();

    let item = |operation, object| ChangeItem {
        operation,
        object,
        error_handler: on_error.clone(),
    };

    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for wanted in desired {
        let key = wanted.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        match current_by_key.get(&key) {
            None => changes.push(item(Operation::Add, wanted.clone())),
            Some(existing) if !existing.payload_eq(wanted) => {
                let mut updated = wanted.clone();
                updated.meta = existing.meta.clone();
                changes.push(item(Operation::Update, updated));
            }
            Some(_) => {}
        }
    }

    for existing in current {
        if !desired_keys.contains(&existing.key()) {
            changes.push(item(Operation::Delete, existing.clone()));
        }
    }

    changes
}
