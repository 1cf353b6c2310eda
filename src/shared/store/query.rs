use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::{Document, StoreError};

/// Resolve a dotted path against a value, fanning out over arrays the way
/// document stores do (`items.name` visits `name` on every element).
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_path(value, &segments, &mut out);
    out
}

fn collect_path<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                collect_path(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect_path(next, rest, out);
                }
            } else {
                for item in items {
                    collect_path(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// First value found at `path` without array fan-out on the last hop.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set `path` inside `doc`, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    let (parents, last) = split_last(path);
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot create field '{}' inside non-object value at '{}'",
                    last, path
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Mutable access to the value at `path`, if every hop exists.
pub fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get_mut(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Remove the value at `path`, returning it.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let (parents, last) = split_last(path);
    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(segment) {
            Some(Value::Object(map)) => map,
            _ => return None,
        };
    }
    current.shift_remove(last)
}

fn split_last(path: &str) -> (Vec<&str>, &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    (segments, last)
}

/// Evaluate a filter document against a stored document.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    let root = Value::Object(doc.clone());
    matches_value(&root, filter)
}

fn matches_value(root: &Value, filter: &Document) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_value(root, clause))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .all(|m| m),
            "$or" => logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_value(root, clause))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .any(|m| m),
            "$nor" => !logical_clauses(key, condition)?
                .iter()
                .map(|clause| matches_value(root, clause))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .any(|m| m),
            op if op.starts_with('$') => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown top level operator: {op}"
                )))
            }
            path => {
                let candidates = lookup_path(root, path);
                matches_condition(&candidates, condition)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_clauses<'a>(op: &str, value: &'a Value) -> Result<Vec<&'a Document>, StoreError> {
    let Value::Array(items) = value else {
        return Err(StoreError::InvalidQuery(format!("{op} expects an array")));
    };
    if items.is_empty() {
        return Err(StoreError::InvalidQuery(format!(
            "{op} expects a non-empty array"
        )));
    }
    items
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| StoreError::InvalidQuery(format!("{op} entries must be objects")))
        })
        .collect()
}

/// True when `value` is an object whose keys are all `$` operators.
pub fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(candidates: &[&Value], condition: &Value) -> Result<bool, StoreError> {
    if let (true, Value::Object(ops)) = (is_operator_object(condition), condition) {
        for (op, operand) in ops {
            if op == "$options" {
                continue;
            }
            if !matches_operator(candidates, op, operand, ops)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    Ok(equals_any(candidates, condition))
}

fn equals_any(candidates: &[&Value], expected: &Value) -> bool {
    if candidates.is_empty() {
        return expected.is_null();
    }
    candidates.iter().any(|candidate| {
        values_equal(candidate, expected)
            || matches!(candidate, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
    })
}

/// Candidate values flattened one level so array fields compare element-wise.
fn flattened<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::new();
    for candidate in candidates {
        match candidate {
            Value::Array(items) => out.extend(items.iter()),
            other => out.push(*other),
        }
    }
    out
}

fn matches_operator(
    candidates: &[&Value],
    op: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> Result<bool, StoreError> {
    let result = match op {
        "$eq" => equals_any(candidates, operand),
        "$ne" => !equals_any(candidates, operand),
        "$gt" | "$gte" | "$lt" | "$lte" => flattened(candidates).iter().any(|candidate| {
            if type_rank(candidate) != type_rank(operand) {
                return false;
            }
            let ord = compare_values(candidate, operand);
            match op {
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }),
        "$in" => in_list(candidates, operand, op)?,
        "$nin" => !in_list(candidates, operand, op)?,
        "$exists" => {
            let wanted = match operand {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                _ => true,
            };
            candidates.is_empty() != wanted
        }
        "$regex" => {
            let Value::String(pattern) = operand else {
                return Err(StoreError::InvalidQuery("$regex expects a string".to_string()));
            };
            let options = siblings
                .get("$options")
                .and_then(Value::as_str)
                .unwrap_or("");
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .dot_matches_new_line(options.contains('s'))
                .ignore_whitespace(options.contains('x'))
                .build()
                .map_err(|e| StoreError::InvalidQuery(format!("invalid $regex: {e}")))?;
            flattened(candidates)
                .iter()
                .any(|candidate| candidate.as_str().is_some_and(|s| regex.is_match(s)))
        }
        "$not" => !matches_condition(candidates, operand)?,
        "$size" => {
            let size = operand
                .as_u64()
                .ok_or_else(|| StoreError::InvalidQuery("$size expects a number".to_string()))?;
            candidates
                .iter()
                .any(|c| matches!(c, Value::Array(items) if items.len() as u64 == size))
        }
        "$all" => {
            let Value::Array(required) = operand else {
                return Err(StoreError::InvalidQuery("$all expects an array".to_string()));
            };
            candidates.iter().any(|candidate| match candidate {
                Value::Array(items) => required
                    .iter()
                    .all(|r| items.iter().any(|item| values_equal(item, r))),
                _ => false,
            })
        }
        "$elemMatch" => {
            let Value::Object(inner) = operand else {
                return Err(StoreError::InvalidQuery(
                    "$elemMatch expects an object".to_string(),
                ));
            };
            let mut found = false;
            for candidate in candidates {
                if let Value::Array(items) = candidate {
                    for item in items {
                        let hit = if is_operator_object(operand) {
                            matches_condition(&[item], operand)?
                        } else {
                            matches_value(item, inner)?
                        };
                        if hit {
                            found = true;
                            break;
                        }
                    }
                }
                if found {
                    break;
                }
            }
            found
        }
        other => {
            return Err(StoreError::InvalidQuery(format!(
                "unknown query operator: {other}"
            )))
        }
    };
    Ok(result)
}

fn in_list(candidates: &[&Value], operand: &Value, op: &str) -> Result<bool, StoreError> {
    let Value::Array(options) = operand else {
        return Err(StoreError::InvalidQuery(format!("{op} expects an array")));
    };
    Ok(options.iter().any(|option| equals_any(candidates, option)))
}

/// Ordering rank of JSON types, used for sorting and range operators.
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Structural equality where `1` and `1.0` are the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Sort documents in place by a `{field: 1 | -1}` spec. Stable.
pub fn sort_documents(docs: &mut [Document], sort: &Document) -> Result<(), StoreError> {
    let keys = sort
        .iter()
        .map(|(field, direction)| {
            let descending = match direction.as_i64() {
                Some(1) => false,
                Some(-1) => true,
                _ => match direction.as_str() {
                    Some("asc") | Some("ascending") => false,
                    Some("desc") | Some("descending") => true,
                    _ => {
                        return Err(StoreError::InvalidQuery(format!(
                            "invalid sort direction for '{field}'"
                        )))
                    }
                },
            };
            Ok((field.clone(), descending))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    docs.sort_by(|left, right| {
        for (field, descending) in &keys {
            let l = get_path(left, field).unwrap_or(&Value::Null);
            let r = get_path(right, field).unwrap_or(&Value::Null);
            let ord = compare_values(l, r);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}
