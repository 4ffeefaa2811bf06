//! Typed, atomic tag updates.
//!
//! Applied in order against a string-valued tag map. Each update evaluates
//! its expression with the map as it stands after the previous updates, so
//! an update can read what an earlier one wrote.

use crate::compile;
use crate::env::Env;
use crate::eval::evaluate;
use crate::value::Value;
use ember_core::{TagKind, TagUpdate, Tags};
use tracing::debug;

/// Apply `updates` to `tags` in order.
///
/// For each update the expression is evaluated and the result converted to
/// the declared kind; scalars overwrite the tag, slice kinds overwrite the
/// element at `index` of the comma-joined value. A failed evaluation,
/// conversion, or out-of-range index leaves the tag untouched and records
/// `false` at that position; the remaining updates still run.
pub fn update_tags(tags: &mut Tags, updates: &[TagUpdate]) -> Vec<bool> {
    let mut results = vec![false; updates.len()];
    for (i, update) in updates.iter().enumerate() {
        results[i] = apply_one(tags, update);
    }
    results
}

fn apply_one(tags: &mut Tags, update: &TagUpdate) -> bool {
    let program = match compile(&update.expression) {
        Ok(program) => program,
        Err(err) => {
            debug!(expression = %update.expression, error = %err, "tag update does not compile");
            return false;
        }
    };
    let env = Env::tag_update(tags);
    let value = match evaluate(program.ast(), &env) {
        Ok(value) => value,
        Err(err) => {
            debug!(expression = %update.expression, error = %err, "tag update does not evaluate");
            return false;
        }
    };

    match update.kind {
        TagKind::String => scalar(tags, update, value.coerce_string()),
        TagKind::Int => scalar(tags, update, value.coerce_int().map(|n| n.to_string())),
        TagKind::Float => scalar(
            tags,
            update,
            value.coerce_float().map(|f| Value::Float(f).to_string()),
        ),
        TagKind::StringSlice => splice(tags, update, value.coerce_string()),
        TagKind::IntSlice => splice(tags, update, value.coerce_int().map(|n| n.to_string())),
        TagKind::FloatSlice => splice(
            tags,
            update,
            value.coerce_float().map(|f| Value::Float(f).to_string()),
        ),
    }
}

fn scalar(tags: &mut Tags, update: &TagUpdate, converted: Option<String>) -> bool {
    match converted {
        Some(value) => {
            tags.insert(update.name.clone(), value);
            true
        }
        None => false,
    }
}

/// Overwrite one element of a comma-joined slice value. An index past the
/// end of the existing value records a failure.
fn splice(tags: &mut Tags, update: &TagUpdate, converted: Option<String>) -> bool {
    let Some(value) = converted else {
        return false;
    };
    let existing = tags.get(&update.name).cloned().unwrap_or_default();
    let mut parts: Vec<String> = existing.split(',').map(str::to_string).collect();
    if update.index >= parts.len() {
        return false;
    }
    parts[update.index] = value;
    tags.insert(update.name.clone(), parts.join(","));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn float_and_slice_updates() {
        let mut map = tags(&[("TEST", "0.1"), ("TestSlice", "1,2,3")]);
        let updates = vec![
            TagUpdate {
                name: "TEST".into(),
                kind: TagKind::Float,
                index: 0,
                expression: r#"AsFloat(Tags["TEST"]) + 17"#.into(),
            },
            TagUpdate {
                name: "TestSlice".into(),
                kind: TagKind::IntSlice,
                index: 1,
                expression: r#"AsIntSlice(Tags["TestSlice"])[1] + 17"#.into(),
            },
        ];
        let results = update_tags(&mut map, &updates);
        assert_eq!(results, [true, true]);
        assert_eq!(map["TEST"], "17.1");
        assert_eq!(map["TestSlice"], "1,19,3");
    }

    #[test]
    fn failed_expression_leaves_tag_untouched() {
        let mut map = tags(&[("TEST", "17")]);
        let update = TagUpdate {
            name: "TEST".into(),
            kind: TagKind::Int,
            index: 0,
            expression: r#"AsInt(Tags["TEST"]) >= 17 ? AsInt(Tags["TEST"]) - 17 : 0 / 0"#.into(),
        };

        // First pass: 17 >= 17, subtracts down to zero.
        let results = update_tags(&mut map, std::slice::from_ref(&update));
        assert_eq!(results, [true]);
        assert_eq!(map["TEST"], "0");

        // Second pass: the guard fails, the divide faults, nothing changes.
        let results = update_tags(&mut map, &[update]);
        assert_eq!(results, [false]);
        assert_eq!(map["TEST"], "0");
    }

    #[test]
    fn out_of_range_slice_index_records_failure() {
        let mut map = tags(&[("s", "1,2")]);
        let update = TagUpdate {
            name: "s".into(),
            kind: TagKind::IntSlice,
            index: 5,
            expression: "42".into(),
        };
        let results = update_tags(&mut map, &[update]);
        assert_eq!(results, [false]);
        assert_eq!(map["s"], "1,2");
    }

    #[test]
    fn later_updates_see_earlier_writes() {
        let mut map = tags(&[("n", "1")]);
        let updates = vec![
            TagUpdate {
                name: "n".into(),
                kind: TagKind::Int,
                index: 0,
                expression: r#"AsInt(Tags["n"]) + 1"#.into(),
            },
            TagUpdate {
                name: "n".into(),
                kind: TagKind::Int,
                index: 0,
                expression: r#"AsInt(Tags["n"]) * 10"#.into(),
            },
        ];
        let results = update_tags(&mut map, &updates);
        assert_eq!(results, [true, true]);
        assert_eq!(map["n"], "20");
    }

    #[test]
    fn missing_slice_tag_has_one_empty_element() {
        let mut map = tags(&[]);
        let update = TagUpdate {
            name: "fresh".into(),
            kind: TagKind::StringSlice,
            index: 0,
            expression: r#""x""#.into(),
        };
        let results = update_tags(&mut map, &[update]);
        assert_eq!(results, [true]);
        assert_eq!(map["fresh"], "x");
    }

    #[test]
    fn weak_conversion_accepts_numeric_strings() {
        let mut map = tags(&[("s", "41")]);
        let update = TagUpdate {
            name: "t".into(),
            kind: TagKind::Int,
            index: 0,
            expression: r#"Tags["s"]"#.into(),
        };
        assert_eq!(update_tags(&mut map, &[update]), [true]);
        assert_eq!(map["t"], "41");
    }
}
