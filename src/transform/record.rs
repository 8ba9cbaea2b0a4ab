use crate::event::{ChangeEvent, Operation, Row, SourcePosition, TableId, Value};
use crate::schema::{SchemaRegistry, TableSchema};
use crate::sequencer::VersionStamp;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("table {0} is not known to the schema registry")]
    UnknownTable(TableId),

    #[error("column '{column}' is not part of {table}")]
    SchemaMismatch { table: TableId, column: String },

    #[error("invalid value for {table}.{column}: {reason}")]
    InvalidValue {
        table: TableId,
        column: String,
        reason: String,
    },

    #[error("event for {table} is missing key column '{column}'")]
    MissingKey { table: TableId, column: String },

    #[error("event at {position} for {table} still does not fit the schema after {attempts} attempts: {reason}")]
    UnresolvableSchemaDrift {
        table: TableId,
        position: SourcePosition,
        attempts: u32,
        reason: String,
    },
}

impl TransformError {
    /// Whether a later DDL on the table may resolve the error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransformError::UnknownTable(_) | TransformError::SchemaMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Upsert,
    Delete,
}

/// One row version bound for the target store.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRowOperation {
    pub table: TableId,
    pub kind: RowKind,
    /// Values in registry column order.
    pub values: Row,
    pub version: VersionStamp,
    pub deleted: bool,
    /// Offset-tracker ticket of the event that produced this operation.
    pub ticket: u64,
}

impl TargetRowOperation {
    pub fn estimated_bytes(&self) -> usize {
        // version + flag + ticket
        self.values.estimated_bytes() + 17
    }
}

/// Turns change events into target row operations against the current schema.
#[derive(Debug, Clone)]
pub struct RecordTransformer {
    registry: Arc<SchemaRegistry>,
}

impl RecordTransformer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn transform(
        &self,
        event: &ChangeEvent,
        version: VersionStamp,
        ticket: u64,
    ) -> Result<Vec<TargetRowOperation>, TransformError> {
        let schema = self
            .registry
            .get(&event.table)
            .ok_or_else(|| TransformError::UnknownTable(event.table.clone()))?;

        if let Some(column) = event.referenced_columns().find(|c| !schema.has_column(c)) {
            return Err(TransformError::SchemaMismatch {
                table: event.table.clone(),
                column: column.to_string(),
            });
        }

        let op = |kind, values, deleted| TargetRowOperation {
            table: event.table.clone(),
            kind,
            values,
            version,
            deleted,
            ticket,
        };

        match event.op {
            Operation::Insert | Operation::SnapshotRead => {
                let values = project(&schema, &event.after)?;
                Ok(vec![op(RowKind::Upsert, values, false)])
            }
            Operation::Update => {
                let values = project(&schema, &event.after)?;
                let mut ops = Vec::with_capacity(2);

                // A moved key leaves a tombstone behind for the old identity.
                if let Some(before) = event.before.as_ref().filter(|b| !b.is_empty()) {
                    if key_changed(&schema, before, &values) {
                        let old = project(&schema, before)?;
                        ops.push(op(RowKind::Delete, old, true));
                    }
                }
                ops.push(op(RowKind::Upsert, values, false));
                Ok(ops)
            }
            Operation::Delete => {
                let image = match &event.before {
                    Some(before) if !before.is_empty() => before,
                    _ => &event.after,
                };
                let values = project(&schema, image)?;
                Ok(vec![op(RowKind::Delete, values, true)])
            }
        }
    }
}

/// Lay an event image out in registry order, coercing every value.
fn project(schema: &TableSchema, image: &Row) -> Result<Row, TransformError> {
    let mut values = Row::with_capacity(schema.columns.len());

    for column in &schema.columns {
        let raw = image.get(&column.name).cloned().unwrap_or(Value::Null);
        let value = if raw.is_null() {
            if schema.is_key_column(&column.name) {
                return Err(TransformError::MissingKey {
                    table: schema.table.clone(),
                    column: column.name.clone(),
                });
            }
            if column.nullable {
                Value::Null
            } else {
                column.target_type.default_value()
            }
        } else {
            column
                .target_type
                .coerce(raw)
                .map_err(|reason| TransformError::InvalidValue {
                    table: schema.table.clone(),
                    column: column.name.clone(),
                    reason,
                })?
        };
        values.insert(column.name.clone(), value);
    }

    Ok(values)
}

fn key_changed(schema: &TableSchema, before: &Row, after: &Row) -> bool {
    if schema.primary_key.is_empty() {
        return false;
    }
    schema.primary_key.iter().any(|key| match before.get(key) {
        Some(old) if !old.is_null() => {
            let old = schema
                .column(key)
                .and_then(|c| c.target_type.coerce(old.clone()).ok());
            old.as_ref() != after.get(key)
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, TargetType};

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry.replace(TableSchema {
            table: TableId::new("shop", "items"),
            columns: vec![
                ColumnSchema::new("id", TargetType::Integer, false),
                ColumnSchema::new("name", TargetType::Varchar, true),
                ColumnSchema::new("qty", TargetType::Integer, false),
            ],
            primary_key: vec!["id".to_string()],
        });
        Arc::new(registry)
    }

    fn event(op: Operation, after: Row, before: Option<Row>) -> ChangeEvent {
        ChangeEvent {
            table: TableId::new("shop", "items"),
            op,
            after,
            before,
            position: SourcePosition::from_index(1),
            source_ts_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_insert_fills_missing_columns() {
        let transformer = RecordTransformer::new(registry());
        let after: Row = vec![("qty", Value::Int(3)), ("id", Value::Int(7))]
            .into_iter()
            .collect();

        let ops = transformer
            .transform(&event(Operation::Insert, after, None), VersionStamp(5), 1)
            .unwrap();

        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.kind, RowKind::Upsert);
        assert!(!op.deleted);
        assert_eq!(op.version, VersionStamp(5));
        assert_eq!(op.values.names().collect::<Vec<_>>(), vec!["id", "name", "qty"]);
        assert_eq!(op.values.get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_delete_uses_before_image() {
        let transformer = RecordTransformer::new(registry());
        let before: Row = vec![("id", Value::Int(7)), ("qty", Value::Int(1))]
            .into_iter()
            .collect();

        let ops = transformer
            .transform(&event(Operation::Delete, Row::new(), Some(before)), VersionStamp(9), 2)
            .unwrap();

        assert_eq!(ops[0].kind, RowKind::Delete);
        assert!(ops[0].deleted);
        assert_eq!(ops[0].values.get("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_key_change_emits_tombstone() {
        let transformer = RecordTransformer::new(registry());
        let before: Row = vec![("id", Value::Int(1)), ("qty", Value::Int(1))]
            .into_iter()
            .collect();
        let after: Row = vec![("id", Value::Int(2)), ("qty", Value::Int(1))]
            .into_iter()
            .collect();

        let ops = transformer
            .transform(&event(Operation::Update, after, Some(before)), VersionStamp(3), 4)
            .unwrap();

        assert_eq!(ops.len(), 2);
        assert!(ops[0].deleted);
        assert_eq!(ops[0].values.get("id"), Some(&Value::Int(1)));
        assert_eq!(ops[1].values.get("id"), Some(&Value::Int(2)));
        assert!(ops.iter().all(|o| o.version == VersionStamp(3)));
    }

    #[test]
    fn test_unknown_column_is_recoverable() {
        let transformer = RecordTransformer::new(registry());
        let after: Row = vec![("id", Value::Int(1)), ("color", Value::from("red"))]
            .into_iter()
            .collect();

        let err = transformer
            .transform(&event(Operation::Insert, after, None), VersionStamp(1), 1)
            .unwrap_err();

        assert!(matches!(err, TransformError::SchemaMismatch { ref column, .. } if column == "color"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_missing_key_and_bad_value_are_fatal() {
        let transformer = RecordTransformer::new(registry());

        let no_key: Row = vec![("qty", Value::Int(1))].into_iter().collect();
        let err = transformer
            .transform(&event(Operation::Insert, no_key, None), VersionStamp(1), 1)
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingKey { .. }));
        assert!(!err.is_recoverable());

        let bad: Row = vec![("id", Value::Int(1)), ("qty", Value::from("many"))]
            .into_iter()
            .collect();
        let err = transformer
            .transform(&event(Operation::Insert, bad, None), VersionStamp(2), 2)
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidValue { .. }));
    }
}
