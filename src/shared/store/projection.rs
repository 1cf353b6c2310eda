use serde_json::{Map, Value};

use super::query::remove_path;
use super::{Document, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only these paths (plus `_id` unless `include_id` is false).
    Include { paths: Vec<String>, include_id: bool },
    /// Drop these paths.
    Exclude(Vec<String>),
}

impl Projection {
    /// Parse `{field: 1}` / `{field: 0}` style projections. An empty spec
    /// means "everything" and yields `None`.
    pub fn parse(spec: &Document) -> Result<Option<Self>, StoreError> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        let mut include_id = true;

        for (path, flag) in spec {
            let keep = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                _ => {
                    return Err(StoreError::InvalidQuery(format!(
                        "projection value for '{path}' must be 0/1 or a boolean"
                    )))
                }
            };
            if path == "_id" {
                include_id = keep;
                continue;
            }
            if keep {
                include.push(path.clone());
            } else {
                exclude.push(path.clone());
            }
        }

        match (include.is_empty(), exclude.is_empty()) {
            (false, false) => Err(StoreError::InvalidQuery(
                "projection cannot mix inclusion and exclusion".to_string(),
            )),
            (false, true) => Ok(Some(Projection::Include {
                paths: include,
                include_id,
            })),
            (true, false) => {
                if !include_id {
                    exclude.push("_id".to_string());
                }
                Ok(Some(Projection::Exclude(exclude)))
            }
            (true, true) if !include_id => Ok(Some(Projection::Exclude(vec!["_id".to_string()]))),
            (true, true) => Ok(None),
        }
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self {
            Projection::Include { paths, include_id } => {
                let mut out = Map::new();
                if *include_id {
                    if let Some(id) = doc.get("_id") {
                        out.insert("_id".to_string(), id.clone());
                    }
                }
                for path in paths {
                    copy_path(doc, &mut out, path);
                }
                out
            }
            Projection::Exclude(paths) => {
                let mut out = doc.clone();
                for path in paths {
                    remove_path(&mut out, path);
                }
                out
            }
        }
    }
}

fn copy_path(source: &Document, target: &mut Document, path: &str) {
    if let Some((head, rest)) = path.split_once('.') {
        match source.get(head) {
            Some(Value::Array(items)) => {
                let mut previous = match target.shift_remove(head) {
                    Some(Value::Array(existing)) => existing.into_iter(),
                    _ => Vec::new().into_iter(),
                };
                let projected: Vec<Value> = items
                    .iter()
                    .filter_map(|item| item.as_object())
                    .map(|item| {
                        let mut sub = match previous.next() {
                            Some(Value::Object(existing)) => existing,
                            _ => Map::new(),
                        };
                        copy_path(item, &mut sub, rest);
                        Value::Object(sub)
                    })
                    .collect();
                target.insert(head.to_string(), Value::Array(projected));
            }
            Some(Value::Object(inner)) => {
                let mut sub = match target.shift_remove(head) {
                    Some(Value::Object(existing)) => existing,
                    _ => Map::new(),
                };
                copy_path(inner, &mut sub, rest);
                target.insert(head.to_string(), Value::Object(sub));
            }
            _ => {}
        }
        return;
    }
    if let Some(value) = source.get(path) {
        target.insert(path.to_string(), value.clone());
    }
}

/// Convert the space separated shorthand (`"name email -password"`) into a
/// projection document.
pub fn projection_from_fields(fields: &str) -> Document {
    let mut spec = Map::new();
    for token in fields.split_whitespace() {
        match token.strip_prefix('-') {
            Some(name) if !name.is_empty() => {
                spec.insert(name.to_string(), Value::from(0));
            }
            _ => {
                spec.insert(token.trim_start_matches('+').to_string(), Value::from(1));
            }
        }
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_inclusion_keeps_id_and_nested() {
        let source = doc(json!({"_id": "1", "name": "n", "secret": "s", "addr": {"city": "c", "zip": "z"}}));
        let projection = Projection::parse(&doc(json!({"name": 1, "addr.city": 1})))
            .unwrap()
            .unwrap();
        assert_eq!(
            Value::Object(projection.apply(&source)),
            json!({"_id": "1", "name": "n", "addr": {"city": "c"}})
        );
    }

    #[test]
    fn test_exclusion_and_id_suppression() {
        let source = doc(json!({"_id": "1", "name": "n", "secret": "s"}));
        let projection = Projection::parse(&doc(json!({"secret": 0, "_id": 0})))
            .unwrap()
            .unwrap();
        assert_eq!(Value::Object(projection.apply(&source)), json!({"name": "n"}));
    }

    #[test]
    fn test_mixed_projection_rejected() {
        let err = Projection::parse(&doc(json!({"a": 1, "b": 0}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }

    #[test]
    fn test_fields_shorthand() {
        let spec = projection_from_fields("name -password");
        assert_eq!(Value::Object(spec), json!({"name": 1, "password": 0}));
    }
}
