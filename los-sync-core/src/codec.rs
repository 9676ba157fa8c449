//! Aggregate codec: converts between the document form of an aggregate
//! (one row with nested child arrays) and its normalized form (a parent
//! row plus rows in each child table).

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::catalog::{ChildTable, TableDef, ValueKind};
use crate::models::identity::scalar_key;
use crate::models::{Row, CREATED_AT_FIELD, UPDATED_AT_FIELD};

/// Child field naming the timestamps a child took from its parent on
/// decompose. Recompose removes exactly those fields again.
pub const INHERITED_FIELD: &str = "inheritedFields";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Table {0} is not an aggregate")]
    NotAggregate(String),

    #[error("{table} row has no value for key field {field}")]
    MissingParentKey { table: String, field: String },

    #[error("{table}.{field} must be an array of objects")]
    MalformedChildren { table: String, field: String },

    #[error("{table} child {key}: {field} is not a valid {kind} value")]
    BadChildValue {
        table: String,
        key: String,
        field: String,
        kind: &'static str,
    },
}

/// An aggregate document split into its normalized rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposed {
    pub parent: Row,
    /// Child rows keyed by canonical child table name. Every declared
    /// child kind has an entry, possibly empty.
    pub children: BTreeMap<String, Vec<Row>>,
}

fn spec_of(table: &TableDef) -> Result<&[ChildTable], CodecError> {
    table
        .aggregate
        .as_ref()
        .map(|a| a.children.as_slice())
        .ok_or_else(|| CodecError::NotAggregate(table.name.clone()))
}

fn parent_key(table: &TableDef, row: &Row) -> Option<(String, Value)> {
    let field = table.identity.fields().first()?.to_string();
    let value = row.get(&field)?.clone();
    scalar_key(&value)?;
    Some((field, value))
}

/// Splits an aggregate document into the parent row and its child rows.
///
/// Each child is stamped with the parent's key as its link field and
/// inherits the parent's `createdAt`/`updatedAt` when it has none. The
/// inherited names are listed under [`INHERITED_FIELD`]. Missing or `null`
/// child arrays decompose to no children.
pub fn decompose(table: &TableDef, document: &Row) -> Result<Decomposed, CodecError> {
    let specs = spec_of(table)?;
    let (_, key_value) =
        parent_key(table, document).ok_or_else(|| CodecError::MissingParentKey {
            table: table.name.clone(),
            field: table.identity.fields().join(","),
        })?;
    let key_text = scalar_key(&key_value).unwrap_or_default();

    let mut parent = document.clone();
    let mut children = BTreeMap::new();

    for spec in specs {
        let elements = match parent.remove(&spec.field) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(CodecError::MalformedChildren {
                    table: table.name.clone(),
                    field: spec.field.clone(),
                })
            }
        };

        let mut rows = Vec::with_capacity(elements.len());
        for element in elements {
            let mut child = Row::from_value(element).ok_or_else(|| {
                CodecError::MalformedChildren {
                    table: table.name.clone(),
                    field: spec.field.clone(),
                }
            })?;
            child.insert(spec.parent_link_field.clone(), key_value.clone());
            child.remove(INHERITED_FIELD);
            let mut inherited = Vec::new();
            for field in [CREATED_AT_FIELD, UPDATED_AT_FIELD] {
                if !child.contains(field) {
                    if let Some(value) = document.get(field) {
                        child.insert(field, value.clone());
                        inherited.push(Value::from(field));
                    }
                }
            }
            if !inherited.is_empty() {
                child.insert(INHERITED_FIELD, Value::Array(inherited));
            }
            if spec.value_kind == ValueKind::Boolean {
                if let Some(value) = child.get(&spec.value_field) {
                    let flag = to_flag(value).ok_or_else(|| CodecError::BadChildValue {
                        table: spec.table.clone(),
                        key: key_text.clone(),
                        field: spec.value_field.clone(),
                        kind: "boolean",
                    })?;
                    child.insert(spec.value_field.clone(), flag);
                }
            }
            rows.push(child);
        }
        children.insert(spec.table.clone(), rows);
    }

    Ok(Decomposed { parent, children })
}

/// Nests the children belonging to `parent` back into a document.
///
/// Child rows are matched on their link field; rows of other parents are
/// ignored. A child kind with no rows becomes an empty array. Timestamps
/// listed under [`INHERITED_FIELD`] are dropped, so a document survives
/// decompose then recompose unchanged.
pub fn recompose(
    table: &TableDef,
    parent: &Row,
    children: &BTreeMap<String, Vec<Row>>,
) -> Result<Row, CodecError> {
    let specs = spec_of(table)?;
    let (_, key_value) = parent_key(table, parent).ok_or_else(|| CodecError::MissingParentKey {
        table: table.name.clone(),
        field: table.identity.fields().join(","),
    })?;
    let key = scalar_key(&key_value);

    let mut document = parent.clone();
    for spec in specs {
        let nested: Vec<Value> = children
            .get(&spec.table)
            .into_iter()
            .flatten()
            .filter(|row| row.get(&spec.parent_link_field).and_then(scalar_key) == key)
            .map(|row| nest_child(spec, row))
            .collect();
        document.insert(spec.field.clone(), Value::Array(nested));
    }
    Ok(document)
}

/// Recomposes every parent of a table from the full child listings.
///
/// Parents without a usable key are passed through untouched so the
/// merge can count them as malformed. Children whose parent is missing
/// are dropped with a warning.
pub fn recompose_all(
    table: &TableDef,
    parents: Vec<Row>,
    children: &BTreeMap<String, Vec<Row>>,
) -> Result<Vec<Row>, CodecError> {
    let specs = spec_of(table)?;

    // child table -> link value -> rows
    let mut grouped: HashMap<&str, HashMap<String, Vec<Row>>> = HashMap::new();
    for spec in specs {
        let groups = grouped.entry(spec.table.as_str()).or_default();
        for row in children.get(&spec.table).into_iter().flatten() {
            match row.get(&spec.parent_link_field).and_then(scalar_key) {
                Some(link) => groups.entry(link).or_default().push(row.clone()),
                None => tracing::warn!(
                    table = %spec.table,
                    "Dropping child row without {}", spec.parent_link_field
                ),
            }
        }
    }

    let mut documents = Vec::with_capacity(parents.len());
    for parent in parents {
        let Some(key) = parent_key(table, &parent).and_then(|(_, v)| scalar_key(&v)) else {
            documents.push(parent);
            continue;
        };
        let mut own = BTreeMap::new();
        for spec in specs {
            let rows = grouped
                .get_mut(spec.table.as_str())
                .and_then(|groups| groups.remove(&key))
                .unwrap_or_default();
            own.insert(spec.table.clone(), rows);
        }
        documents.push(recompose(table, &parent, &own)?);
    }

    for (child_table, groups) in grouped {
        for (link, rows) in groups {
            tracing::warn!(
                table = %child_table,
                parent = %link,
                count = rows.len(),
                "Orphan child rows have no {} parent", table.name
            );
        }
    }

    Ok(documents)
}

fn nest_child(spec: &ChildTable, row: &Row) -> Value {
    let mut child = row.clone();
    child.remove(&spec.parent_link_field);
    if let Some(Value::Array(inherited)) = child.remove(INHERITED_FIELD) {
        for field in inherited.iter().filter_map(Value::as_str) {
            child.remove(field);
        }
    }
    if spec.value_kind == ValueKind::Boolean {
        if let Some(flag) = child.get(&spec.value_field).and_then(to_flag) {
            child.insert(spec.value_field.clone(), flag == 1);
        }
    }
    child.into_value()
}

fn to_flag(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n.as_f64().map(|f| i64::from(f != 0.0)),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(1),
            "false" | "0" => Some(0),
            _ => None,
        },
        _ => None,
    }
}
