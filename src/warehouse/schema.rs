use serde::Serialize;
use serde_json::{Map, Value};

/// Metadata columns every target table carries, in creation order.
pub const META_COLUMNS: [(&str, FieldType); 7] = [
    (KEY_COLUMN, FieldType::Text),
    ("_dataset", FieldType::Text),
    ("_window_from_utc", FieldType::Timestamp),
    ("_window_to_utc", FieldType::Timestamp),
    ("_ingested_utc", FieldType::Timestamp),
    ("_batch_id", FieldType::Text),
    ("_record_time", FieldType::Timestamp),
];

pub const KEY_COLUMN: &str = "_ingest_key";

pub fn is_meta_column(name: &str) -> bool {
    META_COLUMNS.iter().any(|(n, _)| *n == name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    Text,
    Json,
    Timestamp,
}

impl FieldType {
    /// Column type for a JSON value; None for null, which says nothing about the type.
    pub fn of(v: &Value) -> Option<FieldType> {
        match v {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Boolean),
            Value::Number(n) if n.is_i64() => Some(FieldType::Integer),
            // u64 beyond i64 range does not fit BIGINT
            Value::Number(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::Text),
            Value::Array(_) | Value::Object(_) => Some(FieldType::Json),
        }
    }

    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Boolean => "BOOLEAN",
            FieldType::Integer => "BIGINT",
            FieldType::Float => "DOUBLE PRECISION",
            FieldType::Text => "TEXT",
            FieldType::Json => "JSONB",
            FieldType::Timestamp => "TIMESTAMPTZ",
        }
    }

    /// Map an `information_schema.columns.data_type` back to a field type.
    pub fn from_sql(data_type: &str) -> Option<FieldType> {
        match data_type {
            "boolean" => Some(FieldType::Boolean),
            "bigint" | "integer" | "smallint" => Some(FieldType::Integer),
            "double precision" | "real" | "numeric" => Some(FieldType::Float),
            "text" | "character varying" | "character" => Some(FieldType::Text),
            "jsonb" | "json" => Some(FieldType::Json),
            "timestamp with time zone" | "timestamp without time zone" => Some(FieldType::Timestamp),
            _ => None,
        }
    }

    /// Whether a column of this type can store values of `incoming` unchanged.
    pub fn accepts(&self, incoming: FieldType) -> bool {
        *self == incoming || (*self == FieldType::Float && incoming == FieldType::Integer)
    }

    fn unify(self, other: FieldType) -> Option<FieldType> {
        if self.accepts(other) { return Some(self); }
        if other.accepts(self) { return Some(other); }
        None
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.sql_type()) }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub ty: FieldType,
}

impl Column {
    pub fn new(name: &str, ty: FieldType) -> Self { Column { name: name.to_string(), ty } }
}

/// Ordered record columns of a table or batch (metadata columns excluded).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.ty)
    }

    pub fn push(&mut self, col: Column) { self.columns.push(col); }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.columns.iter().map(|c| c.name.as_str()) }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaConflict {
    pub column: String,
    pub existing: FieldType,
    pub incoming: FieldType,
}

impl std::fmt::Display for SchemaConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column {} is {} but batch carries {}", self.column, self.existing, self.incoming)
    }
}

/// Infer the record columns of a batch in first-seen order. Fields that are
/// null in every row are left out: they contribute no type and load as null.
pub fn infer<'a, I>(rows: I) -> Result<TableSchema, SchemaConflict>
where
    I: IntoIterator<Item = &'a Map<String, Value>>,
{
    let mut schema = TableSchema::default();
    for row in rows {
        for (name, value) in row {
            let Some(ty) = FieldType::of(value) else { continue };
            if let Some(meta) = META_COLUMNS.iter().find(|(n, _)| n == name) {
                return Err(SchemaConflict { column: name.clone(), existing: meta.1, incoming: ty });
            }
            match schema.columns.iter_mut().find(|c| &c.name == name) {
                None => schema.push(Column::new(name, ty)),
                Some(col) => {
                    col.ty = col.ty.unify(ty).ok_or_else(|| SchemaConflict { column: name.clone(), existing: col.ty, incoming: ty })?;
                }
            }
        }
    }
    Ok(schema)
}

/// Columns to add so that `existing` can hold `batch`. Existing columns are
/// never dropped or retyped.
pub fn plan_evolution(existing: &TableSchema, batch: &TableSchema) -> Result<Vec<Column>, SchemaConflict> {
    let mut added = Vec::new();
    for col in &batch.columns {
        match existing.get(&col.name) {
            None => added.push(col.clone()),
            Some(have) if have.accepts(col.ty) => {}
            Some(have) => return Err(SchemaConflict { column: col.name.clone(), existing: have, incoming: col.ty }),
        }
    }
    Ok(added)
}
