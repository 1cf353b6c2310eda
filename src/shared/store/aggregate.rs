use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value};

use super::query::{
    compare_values, get_path, lookup_path, matches, remove_path, set_path, sort_documents,
    values_equal,
};
use super::{number_value, Document, StoreError};

/// Names of collections referenced by `$lookup` stages, so a backend can
/// load them before the pipeline runs.
pub fn lookup_collections(pipeline: &[Document]) -> Vec<String> {
    pipeline
        .iter()
        .filter_map(|stage| stage.get("$lookup"))
        .filter_map(|spec| spec.get("from"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Run an aggregation pipeline over `docs`. `foreign` holds the contents of
/// every collection named by a `$lookup` stage.
pub fn run_pipeline(
    mut docs: Vec<Document>,
    pipeline: &[Document],
    foreign: &HashMap<String, Vec<Document>>,
) -> Result<Vec<Document>, StoreError> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(StoreError::InvalidQuery(
                "each pipeline stage must have exactly one field".to_string(),
            ));
        };
        docs = match name.as_str() {
            "$match" => {
                let filter = object_spec(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let spec = object_spec(name, spec)?;
                docs.iter()
                    .map(|doc| project_stage(doc, spec))
                    .collect::<Result<_, _>>()?
            }
            "$addFields" | "$set" => {
                let spec = object_spec(name, spec)?;
                let mut out = Vec::with_capacity(docs.len());
                for mut doc in docs {
                    for (path, expr) in spec {
                        let value = eval_expr(expr, &doc)?.unwrap_or(Value::Null);
                        set_path(&mut doc, path, value)?;
                    }
                    out.push(doc);
                }
                out
            }
            "$unset" => {
                let paths: Vec<&str> = match spec {
                    Value::String(path) => vec![path.as_str()],
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    _ => {
                        return Err(StoreError::InvalidQuery(
                            "$unset expects a field name or list of names".to_string(),
                        ))
                    }
                };
                docs.into_iter()
                    .map(|mut doc| {
                        for path in &paths {
                            remove_path(&mut doc, path);
                        }
                        doc
                    })
                    .collect()
            }
            "$group" => group_stage(&docs, object_spec(name, spec)?)?,
            "$sort" => {
                sort_documents(&mut docs, object_spec(name, spec)?)?;
                docs
            }
            "$skip" => {
                let n = count_spec(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = count_spec(name, spec)?;
                docs.into_iter().take(n).collect()
            }
            "$unwind" => unwind_stage(docs, spec)?,
            "$count" => {
                let Value::String(field) = spec else {
                    return Err(StoreError::InvalidQuery(
                        "$count expects a field name".to_string(),
                    ));
                };
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Map::new();
                    out.insert(field.clone(), Value::from(docs.len() as u64));
                    vec![out]
                }
            }
            "$lookup" => lookup_stage(docs, object_spec(name, spec)?, foreign)?,
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unsupported pipeline stage: {other}"
                )))
            }
        };
    }
    Ok(docs)
}

fn object_spec<'a>(stage: &str, spec: &'a Value) -> Result<&'a Document, StoreError> {
    spec.as_object()
        .ok_or_else(|| StoreError::InvalidQuery(format!("{stage} expects an object")))
}

fn count_spec(stage: &str, spec: &Value) -> Result<usize, StoreError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::InvalidQuery(format!("{stage} expects a non-negative integer")))
}

fn is_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
        _ => None,
    }
}

fn project_stage(doc: &Document, spec: &Document) -> Result<Document, StoreError> {
    let exclusion = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| is_flag(v) == Some(false))
        && spec.iter().any(|(_, v)| is_flag(v) == Some(false));

    if exclusion {
        let mut out = doc.clone();
        for (path, _) in spec {
            remove_path(&mut out, path);
        }
        return Ok(out);
    }

    let mut out = Map::new();
    let include_id = spec.get("_id").and_then(is_flag).unwrap_or(true);
    if include_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, expr) in spec {
        if path == "_id" && is_flag(expr).is_some() {
            continue;
        }
        match is_flag(expr) {
            Some(true) => {
                if let Some(value) = get_path(doc, path) {
                    set_path(&mut out, path, value.clone())?;
                }
            }
            Some(false) => {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot exclude '{path}' in an inclusion projection"
                )))
            }
            None => {
                if let Some(value) = eval_expr(expr, doc)? {
                    set_path(&mut out, path, value)?;
                }
            }
        }
    }
    Ok(out)
}

enum Accumulator {
    Sum(f64, bool),
    Avg(f64, u64),
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, StoreError> {
        Ok(match op {
            "$sum" => Accumulator::Sum(0.0, true),
            "$avg" => Accumulator::Avg(0.0, 0),
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(None),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unsupported accumulator: {other}"
                )))
            }
        })
    }

    fn feed(&mut self, value: Option<Value>) {
        match self {
            Accumulator::Sum(total, integral) => {
                if let Some(Value::Number(n)) = value {
                    *integral &= n.is_i64() || n.is_u64();
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            Accumulator::Avg(total, count) => {
                if let Some(Value::Number(n)) = value {
                    *total += n.as_f64().unwrap_or(0.0);
                    *count += 1;
                }
            }
            Accumulator::Min(current) => keep_extreme(current, value, Ordering::Less),
            Accumulator::Max(current) => keep_extreme(current, value, Ordering::Greater),
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value.unwrap_or(Value::Null));
                }
            }
            Accumulator::Last(current) => *current = Some(value.unwrap_or(Value::Null)),
            Accumulator::Push(items) => {
                if let Some(value) = value {
                    items.push(value);
                }
            }
            Accumulator::AddToSet(items) => {
                if let Some(value) = value {
                    if !items.iter().any(|existing| values_equal(existing, &value)) {
                        items.push(value);
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(total, true) => number_value(total),
            Accumulator::Sum(total, false) => Value::from(total),
            Accumulator::Avg(_, 0) => Value::Null,
            Accumulator::Avg(total, count) => Value::from(total / count as f64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
            Accumulator::First(v) | Accumulator::Last(v) => v.unwrap_or(Value::Null),
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Value::Array(items),
        }
    }
}

fn keep_extreme(current: &mut Option<Value>, value: Option<Value>, wanted: Ordering) {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return;
    };
    let replace = match current {
        None => true,
        Some(existing) => compare_values(&value, existing) == wanted,
    };
    if replace {
        *current = Some(value);
    }
}

fn group_stage(docs: &[Document], spec: &Document) -> Result<Vec<Document>, StoreError> {
    let key_expr = spec.get("_id").ok_or_else(|| {
        StoreError::InvalidQuery("$group requires an _id expression".to_string())
    })?;

    let mut fields: Vec<(&String, &str, &Value)> = Vec::new();
    for (name, accumulator) in spec {
        if name == "_id" {
            continue;
        }
        let Some(ops) = accumulator.as_object().filter(|o| o.len() == 1) else {
            return Err(StoreError::InvalidQuery(format!(
                "$group field '{name}' must be a single accumulator object"
            )));
        };
        let (op, expr) = ops
            .iter()
            .next()
            .ok_or_else(|| StoreError::InvalidQuery(format!("empty accumulator for '{name}'")))?;
        fields.push((name, op.as_str(), expr));
    }

    let mut order: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = eval_expr(key_expr, doc)?.unwrap_or(Value::Null);
        let fingerprint = serde_json::to_string(&key)?;
        let slot = match index.get(&fingerprint) {
            Some(slot) => *slot,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>, _>>()?;
                order.push((key, accumulators));
                index.insert(fingerprint, order.len() - 1);
                order.len() - 1
            }
        };
        for (position, (_, _, expr)) in fields.iter().enumerate() {
            let value = eval_expr(expr, doc)?;
            order[slot].1[position].feed(value);
        }
    }

    Ok(order
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((name, _, _), accumulator) in fields.iter().zip(accumulators) {
                out.insert((*name).clone(), accumulator.finish());
            }
            out
        })
        .collect())
}

fn unwind_stage(docs: Vec<Document>, spec: &Value) -> Result<Vec<Document>, StoreError> {
    let (path, preserve) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Object(options) => (
            options.get("path").and_then(Value::as_str).ok_or_else(|| {
                StoreError::InvalidQuery("$unwind requires a path".to_string())
            })?,
            options
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => {
            return Err(StoreError::InvalidQuery(
                "$unwind expects a path or an options object".to_string(),
            ))
        }
    };
    let path = path.strip_prefix('$').ok_or_else(|| {
        StoreError::InvalidQuery("$unwind path must start with '$'".to_string())
    })?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item)?;
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup_stage(
    docs: Vec<Document>,
    spec: &Document,
    foreign: &HashMap<String, Vec<Document>>,
) -> Result<Vec<Document>, StoreError> {
    let field = |name: &str| {
        spec.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::InvalidQuery(format!("$lookup requires '{name}'")))
    };
    let from = field("from")?;
    let local_field = field("localField")?;
    let foreign_field = field("foreignField")?;
    let alias = field("as")?;

    let empty = Vec::new();
    let source = foreign.get(from).unwrap_or(&empty);

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let root = Value::Object(doc.clone());
        let locals: Vec<Value> = lookup_path(&root, local_field)
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            })
            .collect();
        let joined: Vec<Value> = source
            .iter()
            .filter(|candidate| {
                let candidate_root = Value::Object((*candidate).clone());
                let remote = lookup_path(&candidate_root, foreign_field);
                if locals.is_empty() {
                    return remote.is_empty();
                }
                remote.iter().any(|r| locals.iter().any(|l| values_equal(r, l)))
            })
            .cloned()
            .map(Value::Object)
            .collect();
        set_path(&mut doc, alias, Value::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}

/// Evaluate an aggregation expression. `None` means the referenced field is
/// missing.
pub fn eval_expr(expr: &Value, doc: &Document) -> Result<Option<Value>, StoreError> {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            let root = Value::Object(doc.clone());
            let found = lookup_path(&root, &s[1..]);
            Ok(match found.as_slice() {
                [] => None,
                [single] => Some((*single).clone()),
                _ => Some(Value::Array(found.into_iter().cloned().collect())),
            })
        }
        Value::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (op, args) = map
                .iter()
                .next()
                .ok_or_else(|| StoreError::InvalidQuery("empty expression".to_string()))?;
            eval_operator(op, args, doc).map(Some)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if let Some(v) = eval_expr(value, doc)? {
                    out.insert(key.clone(), v);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, doc)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Array(out)))
        }
        other => Ok(Some(other.clone())),
    }
}

fn eval_args(args: &Value, doc: &Document) -> Result<Vec<Value>, StoreError> {
    match args {
        Value::Array(items) => items
            .iter()
            .map(|item| eval_expr(item, doc).map(|v| v.unwrap_or(Value::Null)))
            .collect(),
        single => Ok(vec![eval_expr(single, doc)?.unwrap_or(Value::Null)]),
    }
}

fn eval_operator(op: &str, args: &Value, doc: &Document) -> Result<Value, StoreError> {
    if op == "$literal" {
        return Ok(args.clone());
    }
    let values = eval_args(args, doc)?;
    let numbers = || -> Result<Option<Vec<f64>>, StoreError> {
        if values.iter().any(Value::is_null) {
            return Ok(None);
        }
        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| StoreError::InvalidQuery(format!("{op} only supports numbers")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    };

    match op {
        "$add" => Ok(numbers()?
            .map(|n| number_value(n.iter().sum()))
            .unwrap_or(Value::Null)),
        "$multiply" => Ok(numbers()?
            .map(|n| number_value(n.iter().product()))
            .unwrap_or(Value::Null)),
        "$subtract" | "$divide" => {
            let Some(n) = numbers()? else {
                return Ok(Value::Null);
            };
            let [left, right] = n.as_slice() else {
                return Err(StoreError::InvalidQuery(format!("{op} expects two arguments")));
            };
            if op == "$subtract" {
                Ok(number_value(left - right))
            } else if *right == 0.0 {
                Err(StoreError::InvalidQuery("$divide by zero".to_string()))
            } else {
                Ok(Value::from(left / right))
            }
        }
        "$concat" => {
            let mut out = String::new();
            for value in &values {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(s),
                    _ => {
                        return Err(StoreError::InvalidQuery(
                            "$concat only supports strings".to_string(),
                        ))
                    }
                }
            }
            Ok(Value::String(out))
        }
        "$toUpper" | "$toLower" => {
            let text = match values.first() {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            Ok(Value::String(if op == "$toUpper" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            }))
        }
        "$ifNull" => Ok(values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        "$size" => match values.first() {
            Some(Value::Array(items)) => Ok(Value::from(items.len() as u64)),
            _ => Err(StoreError::InvalidQuery(
                "$size argument must be an array".to_string(),
            )),
        },
        other => Err(StoreError::InvalidQuery(format!(
            "unsupported expression operator: {other}"
        ))),
    }
}
