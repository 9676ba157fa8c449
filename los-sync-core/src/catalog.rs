//! Table catalog: the single registry of every synced entity.
//!
//! Each table has a canonical name (`DailyNotes`), a camelCase API name
//! (`dailyNotes`) and optionally a different name per store side. All
//! other components resolve names through here.

use std::collections::{HashMap, HashSet};

use crate::models::{IdentityKind, Side};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Table name registered twice: {0}")]
    DuplicateName(String),

    #[error("Aggregate {parent} references unregistered child table {child}")]
    UnregisteredChild { parent: String, child: String },

    #[error("Child table {child} unique key must include link field {field}")]
    LinkFieldNotInKey { child: String, field: String },

    #[error("Aggregate {0} must have a single-field natural key")]
    AggregateKey(String),

    #[error("Table {child} is a child of both {first} and {second}")]
    SharedChild {
        child: String,
        first: String,
        second: String,
    },
}

/// Value type of an aggregate child kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Stored as 0/1 on the normalized side, `bool` in the document.
    Boolean,
    /// Passed through unchanged.
    Numeric,
}

/// One dependent child kind of an aggregate table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTable {
    /// Canonical name of the child table.
    pub table: String,
    /// Name of the nested array on the parent document.
    pub field: String,
    /// Child field holding the parent's natural key.
    pub parent_link_field: String,
    pub unique_key: Vec<String>,
    pub value_field: String,
    pub value_kind: ValueKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSpec {
    pub children: Vec<ChildTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub api_name: String,
    pub local_name: Option<String>,
    pub remote_name: Option<String>,
    pub identity: IdentityKind,
    pub aggregate: Option<AggregateSpec>,
}

impl TableDef {
    /// A uuid-keyed table present under the same name on both sides.
    pub fn simple(name: &str, api_name: &str) -> Self {
        Self {
            name: name.to_string(),
            api_name: api_name.to_string(),
            local_name: Some(api_name.to_string()),
            remote_name: Some(name.to_string()),
            identity: IdentityKind::Uuid,
            aggregate: None,
        }
    }

    pub fn with_identity(mut self, identity: IdentityKind) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateSpec) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_side_names(mut self, local: Option<&str>, remote: Option<&str>) -> Self {
        self.local_name = local.map(str::to_string);
        self.remote_name = remote.map(str::to_string);
        self
    }

    /// The name `side` uses for this table, or `None` when that side
    /// keeps no separate table for it.
    pub fn side_name(&self, side: Side) -> Option<&str> {
        match side {
            Side::Local => self.local_name.as_deref(),
            Side::Remote => self.remote_name.as_deref(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    tables: Vec<TableDef>,
    by_name: HashMap<String, usize>,
    parents: HashMap<String, String>,
}

impl Catalog {
    /// Builds and validates a catalog. Any inconsistency is a
    /// configuration error.
    pub fn new(tables: Vec<TableDef>) -> Result<Self, CatalogError> {
        let mut by_name = HashMap::new();
        for (i, def) in tables.iter().enumerate() {
            let mut names: HashSet<&str> = HashSet::new();
            names.insert(&def.name);
            names.insert(&def.api_name);
            names.extend(def.local_name.as_deref());
            names.extend(def.remote_name.as_deref());

            for name in names {
                if by_name.insert(name.to_string(), i).is_some() {
                    return Err(CatalogError::DuplicateName(name.to_string()));
                }
            }
        }

        let mut parents: HashMap<String, String> = HashMap::new();
        for def in &tables {
            let Some(aggregate) = &def.aggregate else {
                continue;
            };
            if !matches!(&def.identity, IdentityKind::Natural(f) if f.len() == 1) {
                return Err(CatalogError::AggregateKey(def.name.clone()));
            }
            for child in &aggregate.children {
                let registered = by_name
                    .get(&child.table)
                    .is_some_and(|&i| tables[i].name == child.table);
                if !registered {
                    return Err(CatalogError::UnregisteredChild {
                        parent: def.name.clone(),
                        child: child.table.clone(),
                    });
                }
                if !child.unique_key.contains(&child.parent_link_field) {
                    return Err(CatalogError::LinkFieldNotInKey {
                        child: child.table.clone(),
                        field: child.parent_link_field.clone(),
                    });
                }
                if let Some(first) = parents.insert(child.table.clone(), def.name.clone()) {
                    return Err(CatalogError::SharedChild {
                        child: child.table.clone(),
                        first,
                        second: def.name.clone(),
                    });
                }
            }
        }

        Ok(Self {
            tables,
            by_name,
            parents,
        })
    }

    /// Every entity of the life-tracking application.
    pub fn builtin() -> Result<Self, CatalogError> {
        let habit_key = || IdentityKind::natural(["date", "habitKey"]);
        let child = |table: &str, field: &str, kind: ValueKind| ChildTable {
            table: table.to_string(),
            field: field.to_string(),
            parent_link_field: "date".to_string(),
            unique_key: vec!["date".to_string(), "habitKey".to_string()],
            value_field: "value".to_string(),
            value_kind: kind,
        };

        let mut tables = vec![
            TableDef::simple("DailyNotes", "dailyNotes")
                .with_identity(IdentityKind::natural(["date"]))
                .with_aggregate(AggregateSpec {
                    children: vec![
                        child("BooleanHabits", "booleanHabits", ValueKind::Boolean),
                        child("QuantifiableHabits", "quantifiableHabits", ValueKind::Numeric),
                    ],
                }),
            TableDef::simple("BooleanHabits", "booleanHabits")
                .with_identity(habit_key())
                .with_side_names(Some("booleanHabits"), None),
            TableDef::simple("QuantifiableHabits", "quantifiableHabits")
                .with_identity(habit_key())
                .with_side_names(Some("quantifiableHabits"), None),
        ];

        for (name, api_name) in [
            ("Time", "time"),
            ("Library", "library"),
            ("Tasks", "tasks"),
            ("Money", "money"),
            ("Text", "text"),
            ("Mood", "mood"),
            ("GPT", "gpt"),
            ("Journal", "journal"),
            ("Tags", "tags"),
            ("People", "people"),
            ("Contact", "contact"),
            ("Pillars", "pillars"),
            ("Objectives", "objectives"),
            ("Music", "music"),
        ] {
            tables.push(TableDef::simple(name, api_name));
        }

        tables.push(
            TableDef::simple("UserSettings", "userSettings")
                .with_identity(IdentityKind::natural(["settingKey"])),
        );

        Self::new(tables)
    }

    /// Looks a table up by canonical, API or side-specific name.
    pub fn resolve(&self, name: &str) -> Result<&TableDef, CatalogError> {
        self.by_name
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| CatalogError::UnknownTable(name.to_string()))
    }

    /// Child tables of an aggregate; empty for simple tables.
    pub fn aggregate_tables_of(&self, name: &str) -> Result<Vec<&TableDef>, CatalogError> {
        let def = self.resolve(name)?;
        let Some(aggregate) = &def.aggregate else {
            return Ok(Vec::new());
        };
        aggregate
            .children
            .iter()
            .map(|child| self.resolve(&child.table))
            .collect()
    }

    pub fn all_tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Tables synced independently, i.e. everything that is not an
    /// aggregate child.
    pub fn root_tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables
            .iter()
            .filter(|def| !self.parents.contains_key(&def.name))
    }

    /// The aggregate a child table belongs to.
    pub fn parent_of(&self, name: &str) -> Option<&TableDef> {
        let def = self.resolve(name).ok()?;
        let parent = self.parents.get(&def.name)?;
        self.resolve(parent).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.all_tables().len(), 18);
        assert_eq!(catalog.root_tables().count(), 16);
        assert!(catalog
            .root_tables()
            .all(|def| def.name != "BooleanHabits" && def.name != "QuantifiableHabits"));
    }

    #[test]
    fn test_resolve_by_any_name() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.resolve("DailyNotes").unwrap().name, "DailyNotes");
        assert_eq!(catalog.resolve("dailyNotes").unwrap().name, "DailyNotes");
        assert_eq!(catalog.resolve("userSettings").unwrap().name, "UserSettings");
        assert!(matches!(
            catalog.resolve("dailynotes"),
            Err(CatalogError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_aggregate_tables_of() {
        let catalog = Catalog::builtin().unwrap();
        let children: Vec<_> = catalog
            .aggregate_tables_of("DailyNotes")
            .unwrap()
            .into_iter()
            .map(|def| def.name.as_str())
            .collect();
        assert_eq!(children, vec!["BooleanHabits", "QuantifiableHabits"]);
        assert!(catalog.aggregate_tables_of("Tasks").unwrap().is_empty());
        assert!(catalog.aggregate_tables_of("Nope").is_err());
        assert_eq!(
            catalog.parent_of("booleanHabits").map(|d| d.name.as_str()),
            Some("DailyNotes")
        );
    }

    #[test]
    fn test_side_names() {
        let catalog = Catalog::builtin().unwrap();
        let habits = catalog.resolve("BooleanHabits").unwrap();
        assert_eq!(habits.side_name(Side::Local), Some("booleanHabits"));
        assert_eq!(habits.side_name(Side::Remote), None);
        let money = catalog.resolve("Money").unwrap();
        assert_eq!(money.side_name(Side::Remote), Some("Money"));
    }

    #[test]
    fn test_rejects_unregistered_child() {
        let parent = TableDef::simple("Notes", "notes")
            .with_identity(IdentityKind::natural(["date"]))
            .with_aggregate(AggregateSpec {
                children: vec![ChildTable {
                    table: "Missing".to_string(),
                    field: "missing".to_string(),
                    parent_link_field: "date".to_string(),
                    unique_key: vec!["date".to_string(), "key".to_string()],
                    value_field: "value".to_string(),
                    value_kind: ValueKind::Numeric,
                }],
            });
        assert!(matches!(
            Catalog::new(vec![parent]),
            Err(CatalogError::UnregisteredChild { .. })
        ));
    }

    #[test]
    fn test_rejects_link_field_outside_key() {
        let parent = TableDef::simple("Notes", "notes")
            .with_identity(IdentityKind::natural(["date"]))
            .with_aggregate(AggregateSpec {
                children: vec![ChildTable {
                    table: "Items".to_string(),
                    field: "items".to_string(),
                    parent_link_field: "date".to_string(),
                    unique_key: vec!["key".to_string()],
                    value_field: "value".to_string(),
                    value_kind: ValueKind::Numeric,
                }],
            });
        let child = TableDef::simple("Items", "items");
        assert!(matches!(
            Catalog::new(vec![parent, child]),
            Err(CatalogError::LinkFieldNotInKey { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = Catalog::new(vec![
            TableDef::simple("Tasks", "tasks"),
            TableDef::simple("Todo", "tasks"),
        ]);
        assert!(matches!(result, Err(CatalogError::DuplicateName(n)) if n == "tasks"));
    }
}
