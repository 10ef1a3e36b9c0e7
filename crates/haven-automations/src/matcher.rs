//! The event match predicate.
//!
//! `match_conditions` maps dotted field paths to expected values. All keys
//! must match (AND). Values compare by deep equality, except when both the
//! expected and observed values are lists — then the expected list must be
//! a subset of the observed one. Absent paths never match; an empty object
//! matches any event.

use serde_json::Value;

pub fn matches_conditions(conditions: &Value, event: &Value) -> bool {
    let Value::Object(map) = conditions else {
        // Anything other than an object is a misconfigured predicate; fail
        // closed so a broken listener never fires on every event.
        return false;
    };

    map.iter().all(|(path, expected)| {
        match resolve_path(event, path) {
            Some(observed) => value_matches(expected, observed),
            None => false,
        }
    })
}

/// Walk `a.b.c` through nested objects.
fn resolve_path<'a>(event: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = event;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_matches(expected: &Value, observed: &Value) -> bool {
    match (expected, observed) {
        // List vs list: subset containment, not equality.
        (Value::Array(expected_items), Value::Array(observed_items)) => expected_items
            .iter()
            .all(|item| observed_items.contains(item)),
        (expected, observed) => expected == observed,
    }
}
