use serde_json::{Map, Value};

use super::query::{
    compare_values, get_path, get_path_mut, is_operator_object, matches, remove_path, set_path,
    values_equal,
};
use super::{number_value, Document, StoreError};

const UPDATE_OPERATORS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$push",
    "$addToSet",
    "$pull",
    "$rename",
    "$setOnInsert",
];

/// Fold plain top-level keys into `$set`, leaving operator keys as they are.
pub fn normalize_update(update: &Document) -> Result<Document, StoreError> {
    let mut normalized = Map::new();
    let mut implicit_set = Map::new();

    for (key, value) in update {
        if key.starts_with('$') {
            if !UPDATE_OPERATORS.contains(&key.as_str()) {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown update operator: {key}"
                )));
            }
            let Value::Object(fields) = value else {
                return Err(StoreError::InvalidQuery(format!(
                    "{key} expects an object of fields"
                )));
            };
            match normalized.get_mut(key) {
                Some(Value::Object(existing)) => {
                    for (field, v) in fields {
                        existing.insert(field.clone(), v.clone());
                    }
                }
                _ => {
                    normalized.insert(key.clone(), value.clone());
                }
            }
        } else {
            implicit_set.insert(key.clone(), value.clone());
        }
    }

    if !implicit_set.is_empty() {
        match normalized.get_mut("$set") {
            Some(Value::Object(existing)) => {
                for (field, v) in implicit_set {
                    existing.insert(field, v);
                }
            }
            _ => {
                normalized.insert("$set".to_string(), Value::Object(implicit_set));
            }
        }
    }

    Ok(normalized)
}

/// Apply a normalized update document to `doc`.
///
/// `inserting` enables `$setOnInsert`, which is otherwise ignored.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<(), StoreError> {
    let original_id = doc.get("_id").cloned();

    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(StoreError::InvalidQuery(format!(
                "{op} expects an object of fields"
            )));
        };
        for (path, operand) in fields {
            apply_operator(doc, op, path, operand, inserting)?;
        }
    }

    if let Some(id) = original_id {
        match doc.get("_id") {
            Some(current) if values_equal(current, &id) => {}
            _ => {
                return Err(StoreError::InvalidQuery(
                    "the _id field cannot be modified".to_string(),
                ))
            }
        }
    }
    Ok(())
}

fn apply_operator(
    doc: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
    inserting: bool,
) -> Result<(), StoreError> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" | "$mul" => {
            let delta = operand.as_f64().ok_or_else(|| {
                StoreError::InvalidQuery(format!("{op} on '{path}' expects a number"))
            })?;
            let next = match get_path(doc, path) {
                None | Some(Value::Null) if op == "$inc" => operand.clone(),
                None | Some(Value::Null) => number_value(0.0),
                Some(Value::Number(current)) => {
                    arithmetic(op, current, operand).unwrap_or_else(|| {
                        let current = current.as_f64().unwrap_or(0.0);
                        if op == "$inc" {
                            number_value(current + delta)
                        } else {
                            number_value(current * delta)
                        }
                    })
                }
                Some(_) => {
                    return Err(StoreError::InvalidQuery(format!(
                        "cannot apply {op} to non-numeric field '{path}'"
                    )))
                }
            };
            set_path(doc, path, next)
        }
        "$min" | "$max" => {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => {
                    let ord = compare_values(operand, current);
                    if op == "$min" {
                        ord == std::cmp::Ordering::Less
                    } else {
                        ord == std::cmp::Ordering::Greater
                    }
                }
            };
            if replace {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$push" | "$addToSet" => {
            let values = each_values(operand);
            let array = array_at(doc, path, op)?;
            for value in values {
                if op == "$addToSet" && array.iter().any(|existing| values_equal(existing, &value)) {
                    continue;
                }
                array.push(value);
            }
            Ok(())
        }
        "$pull" => {
            let Some(target) = get_path_mut(doc, path) else {
                return Ok(());
            };
            let Value::Array(items) = target else {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot apply $pull to non-array field '{path}'"
                )));
            };
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if !pull_matches(&item, operand)? {
                    kept.push(item);
                }
            }
            *items = kept;
            Ok(())
        }
        "$rename" => {
            let Value::String(to) = operand else {
                return Err(StoreError::InvalidQuery(format!(
                    "$rename target for '{path}' must be a string"
                )));
            };
            if let Some(value) = remove_path(doc, path) {
                set_path(doc, to, value)?;
            }
            Ok(())
        }
        other => Err(StoreError::InvalidQuery(format!(
            "unknown update operator: {other}"
        ))),
    }
}

fn arithmetic(op: &str, current: &serde_json::Number, operand: &Value) -> Option<Value> {
    let left = current.as_i64()?;
    let right = operand.as_i64()?;
    let result = if op == "$inc" {
        left.checked_add(right)?
    } else {
        left.checked_mul(right)?
    };
    Some(Value::from(result))
}

fn each_values(operand: &Value) -> Vec<Value> {
    match operand {
        Value::Object(map) if map.len() == 1 && map.contains_key("$each") => match &map["$each"] {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        },
        other => vec![other.clone()],
    }
}

fn array_at<'a>(doc: &'a mut Document, path: &str, op: &str) -> Result<&'a mut Vec<Value>, StoreError> {
    if get_path(doc, path).is_none() {
        set_path(doc, path, Value::Array(Vec::new()))?;
    }
    match get_path_mut(doc, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(StoreError::InvalidQuery(format!(
            "cannot apply {op} to non-array field '{path}'"
        ))),
    }
}

fn pull_matches(item: &Value, condition: &Value) -> Result<bool, StoreError> {
    if is_operator_object(condition) {
        let mut wrapper = Map::new();
        wrapper.insert("v".to_string(), item.clone());
        let mut filter = Map::new();
        filter.insert("v".to_string(), condition.clone());
        return matches(&wrapper, &filter);
    }
    match (item, condition) {
        (Value::Object(fields), Value::Object(filter)) => matches(fields, filter),
        _ => Ok(values_equal(item, condition)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plain_fields_become_set() {
        let update = normalize_update(&doc(json!({"name": "n", "$inc": {"v": 1}}))).unwrap();
        assert_eq!(update["$set"], json!({"name": "n"}));
        assert_eq!(update["$inc"], json!({"v": 1}));
    }

    #[test]
    fn test_plain_fields_override_explicit_set() {
        let update = normalize_update(&doc(json!({
            "$set": {"name": "old", "age": 3},
            "name": "new"
        })))
        .unwrap();
        assert_eq!(update["$set"], json!({"name": "new", "age": 3}));
    }

    #[test]
    fn test_apply_set_inc_push() {
        let mut d = doc(json!({"_id": "1", "v": 1, "tags": ["a"]}));
        let update = normalize_update(&doc(json!({
            "profile.city": "Oslo",
            "$inc": {"v": 2},
            "$push": {"tags": {"$each": ["b", "c"]}},
            "$addToSet": {"tags": "a"}
        })))
        .unwrap();
        apply_update(&mut d, &update, false).unwrap();
        assert_eq!(d["v"], json!(3));
        assert_eq!(d["profile"], json!({"city": "Oslo"}));
        assert_eq!(d["tags"], json!(["a", "b", "c"]));
    }

    #[test]
    fn test_pull_unset_rename() {
        let mut d = doc(json!({"_id": 1, "nums": [1, 5, 9], "old": true, "gone": 1}));
        let update = doc(json!({
            "$pull": {"nums": {"$gte": 5}},
            "$rename": {"old": "new"},
            "$unset": {"gone": ""}
        }));
        apply_update(&mut d, &update, false).unwrap();
        assert_eq!(d["nums"], json!([1]));
        assert_eq!(d["new"], json!(true));
        assert!(!d.contains_key("gone"));
        assert!(!d.contains_key("old"));
    }

    #[test]
    fn test_id_is_immutable() {
        let mut d = doc(json!({"_id": "a"}));
        let update = doc(json!({"$set": {"_id": "b"}}));
        assert!(matches!(
            apply_update(&mut d, &update, false),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let update = doc(json!({"$setOnInsert": {"createdAt": 1}}));
        let mut existing = doc(json!({"_id": "a"}));
        apply_update(&mut existing, &update, false).unwrap();
        assert!(!existing.contains_key("createdAt"));
        let mut fresh = doc(json!({"_id": "a"}));
        apply_update(&mut fresh, &update, true).unwrap();
        assert_eq!(fresh["createdAt"], json!(1));
    }
}
