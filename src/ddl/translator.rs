use super::parser::{parse_statement, AlterAction, ColumnDef, DdlCommand, ParsedDdl};
use super::DdlError;
use crate::event::{DdlEvent, TableId};
use crate::schema::{
    is_reserved_column, ColumnSchema, RegistryChange, SchemaRegistry, TableSchema, TargetType,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One schema change against the target store, executed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDdl {
    CreateSchema(String),
    CreateTable(TableSchema),
    AddColumn { table: TableId, column: ColumnSchema },
    DropColumn { table: TableId, column: String },
    RenameColumn { table: TableId, from: String, to: String },
    AlterColumnType { table: TableId, column: String, target_type: TargetType },
    SetNotNull { table: TableId, column: String },
    DropNotNull { table: TableId, column: String },
    RenameTable { from: TableId, to: TableId },
    DropTable(TableId),
    Truncate(TableId),
}

/// Statements to run, and the registry entries already committed for them.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub statements: Vec<TargetDdl>,
    pub changes: Vec<RegistryChange>,
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty() && self.changes.is_empty()
    }
}

/// Translates source DDL into target statements and keeps the registry in step.
#[derive(Debug, Clone)]
pub struct DdlTranslator {
    registry: Arc<SchemaRegistry>,
    default_database: String,
}

impl DdlTranslator {
    pub fn new(registry: Arc<SchemaRegistry>, default_database: impl Into<String>) -> Self {
        Self {
            registry,
            default_database: default_database.into(),
        }
    }

    pub fn parse(&self, event: &DdlEvent) -> Result<ParsedDdl, DdlError> {
        let database = event.database.as_deref().unwrap_or(&self.default_database);
        parse_statement(&event.statement, database)
    }

    /// Translate a parsed statement and commit the resulting schema.
    ///
    /// Every command is checked against a working copy first; on error the
    /// registry is left exactly as it was.
    pub fn translate(&self, parsed: &ParsedDdl) -> Result<Translation, DdlError> {
        let mut work = WorkingSet::new(&self.registry);
        let mut statements = Vec::new();
        let fail = |table: &TableId, reason: String| DdlError::Unsupported {
            table: Some(table.clone()),
            reason,
            statement: parsed.statement.clone(),
        };

        match &parsed.command {
            DdlCommand::Ignored => {}
            DdlCommand::CreateDatabase(name) => {
                statements.push(TargetDdl::CreateSchema(name.clone()));
            }
            DdlCommand::CreateTable {
                table,
                columns,
                primary_key,
            } => {
                if work.get(table).is_none() {
                    let schema = build_table(table, columns, primary_key).map_err(|r| fail(table, r))?;
                    statements.push(TargetDdl::CreateSchema(table.schema.clone()));
                    statements.push(TargetDdl::CreateTable(schema.clone()));
                    work.put(schema);
                }
            }
            DdlCommand::AlterTable { table, actions } => {
                let mut current = table.clone();
                for action in actions {
                    let mut schema = work
                        .get(&current)
                        .ok_or_else(|| fail(&current, "table is not known".to_string()))?;
                    match action {
                        AlterAction::Ignored => continue,
                        AlterAction::RenameTable(to) => {
                            rename_table(&mut work, &current, to, &mut statements)
                                .map_err(|r| fail(&current, r))?;
                            current = to.clone();
                            continue;
                        }
                        _ => apply_alter(&mut schema, action, &mut statements)
                            .map_err(|r| fail(&current, r))?,
                    }
                    work.put(schema);
                }
            }
            DdlCommand::RenameTables(pairs) => {
                for (from, to) in pairs {
                    rename_table(&mut work, from, to, &mut statements).map_err(|r| fail(from, r))?;
                }
            }
            DdlCommand::DropTables(tables) => {
                for table in tables {
                    if work.get(table).is_some() {
                        work.remove(table);
                        statements.push(TargetDdl::DropTable(table.clone()));
                    }
                }
            }
            DdlCommand::Truncate(table) => {
                if work.get(table).is_some() {
                    statements.push(TargetDdl::Truncate(table.clone()));
                }
            }
        }

        let changes = work.into_changes(&self.registry);
        if !changes.is_empty() {
            self.registry.apply(changes.clone());
        }
        Ok(Translation {
            statements,
            changes,
        })
    }
}

/// Copy-on-write view of the registry used while validating one statement.
struct WorkingSet {
    entries: BTreeMap<TableId, Option<TableSchema>>,
    base: BTreeMap<TableId, Arc<TableSchema>>,
}

impl WorkingSet {
    fn new(registry: &SchemaRegistry) -> Self {
        let base = registry
            .tables()
            .into_iter()
            .map(|schema| (schema.table.clone(), schema))
            .collect();
        Self {
            entries: BTreeMap::new(),
            base,
        }
    }

    fn get(&self, table: &TableId) -> Option<TableSchema> {
        match self.entries.get(table) {
            Some(entry) => entry.clone(),
            None => self.base.get(table).map(|s| (**s).clone()),
        }
    }

    fn put(&mut self, schema: TableSchema) {
        self.entries.insert(schema.table.clone(), Some(schema));
    }

    fn remove(&mut self, table: &TableId) {
        self.entries.insert(table.clone(), None);
    }

    fn into_changes(self, registry: &SchemaRegistry) -> Vec<RegistryChange> {
        let mut removals = Vec::new();
        let mut puts = Vec::new();
        for (table, entry) in self.entries {
            let original = registry.get(&table);
            match entry {
                Some(schema) if original.as_deref() != Some(&schema) => {
                    puts.push(RegistryChange::Put(schema))
                }
                None if original.is_some() => removals.push(RegistryChange::Remove(table)),
                _ => {}
            }
        }
        removals.extend(puts);
        removals
    }
}

fn build_table(
    table: &TableId,
    columns: &[ColumnDef],
    primary_key: &[String],
) -> Result<TableSchema, String> {
    let mut schema = TableSchema {
        table: table.clone(),
        columns: Vec::with_capacity(columns.len()),
        primary_key: primary_key.to_vec(),
    };
    for def in columns {
        if schema.has_column(&def.name) {
            return Err(format!("column '{}' is defined twice", def.name));
        }
        schema.columns.push(column_schema(def)?);
    }
    for key in &schema.primary_key {
        let column = schema
            .columns
            .iter_mut()
            .find(|c| &c.name == key)
            .ok_or_else(|| format!("primary key column '{}' is not defined", key))?;
        column.nullable = false;
    }
    Ok(schema)
}

fn column_schema(def: &ColumnDef) -> Result<ColumnSchema, String> {
    if is_reserved_column(&def.name) {
        return Err(format!("column name '{}' is reserved", def.name));
    }
    let target_type = TargetType::from_source(&def.type_name, def.type_args.as_deref(), def.unsigned)
        .map_err(|e| e.to_string())?;
    Ok(ColumnSchema::new(
        def.name.clone(),
        target_type,
        def.nullable && !def.primary_key,
    ))
}

fn apply_alter(
    schema: &mut TableSchema,
    action: &AlterAction,
    statements: &mut Vec<TargetDdl>,
) -> Result<(), String> {
    let table = schema.table.clone();
    match action {
        AlterAction::AddColumn(def) => {
            if def.primary_key {
                return Err("adding a primary key column is not supported".to_string());
            }
            if schema.has_column(&def.name) {
                return Ok(());
            }
            let column = column_schema(def)?;
            schema.columns.push(column.clone());
            statements.push(TargetDdl::AddColumn { table, column });
        }
        AlterAction::DropColumn(name) => {
            if !schema.has_column(name) {
                return Ok(());
            }
            if schema.is_key_column(name) {
                return Err(format!("cannot drop primary key column '{}'", name));
            }
            schema.columns.retain(|c| &c.name != name);
            statements.push(TargetDdl::DropColumn {
                table,
                column: name.clone(),
            });
        }
        AlterAction::RenameColumn { from, to } => {
            rename_column(schema, from, to, statements)?;
        }
        AlterAction::ChangeColumn { from, column } => {
            if from != &column.name {
                rename_column(schema, from, &column.name, statements)?;
            }
            modify_column(schema, column, statements)?;
        }
        AlterAction::ModifyColumn(column) => modify_column(schema, column, statements)?,
        AlterAction::RenameTable(_) | AlterAction::Ignored => {}
    }
    Ok(())
}

fn rename_column(
    schema: &mut TableSchema,
    from: &str,
    to: &str,
    statements: &mut Vec<TargetDdl>,
) -> Result<(), String> {
    if !schema.has_column(from) {
        if schema.has_column(to) {
            // Already applied.
            return Ok(());
        }
        return Err(format!("column '{}' does not exist", from));
    }
    if schema.has_column(to) {
        return Err(format!("column '{}' already exists", to));
    }
    if is_reserved_column(to) {
        return Err(format!("column name '{}' is reserved", to));
    }

    if let Some(column) = schema.column_mut(from) {
        column.name = to.to_string();
    }
    for key in schema.primary_key.iter_mut().filter(|k| k.as_str() == from) {
        *key = to.to_string();
    }
    statements.push(TargetDdl::RenameColumn {
        table: schema.table.clone(),
        from: from.to_string(),
        to: to.to_string(),
    });
    Ok(())
}

fn modify_column(
    schema: &mut TableSchema,
    def: &ColumnDef,
    statements: &mut Vec<TargetDdl>,
) -> Result<(), String> {
    let table = schema.table.clone();
    let is_key = schema.is_key_column(&def.name);
    let wanted = column_schema(def)?;
    let existing = schema
        .column_mut(&def.name)
        .ok_or_else(|| format!("column '{}' does not exist", def.name))?;

    if existing.target_type != wanted.target_type {
        if is_key {
            return Err(format!("cannot change the type of key column '{}'", def.name));
        }
        if !existing.target_type.can_widen_to(&wanted.target_type) {
            return Err(format!(
                "narrowing '{}' from {} to {} would lose data",
                def.name, existing.target_type, wanted.target_type
            ));
        }
        existing.target_type = wanted.target_type;
        statements.push(TargetDdl::AlterColumnType {
            table: table.clone(),
            column: def.name.clone(),
            target_type: wanted.target_type,
        });
    }

    if !is_key && existing.nullable != wanted.nullable {
        existing.nullable = wanted.nullable;
        let column = def.name.clone();
        statements.push(if wanted.nullable {
            TargetDdl::DropNotNull { table, column }
        } else {
            TargetDdl::SetNotNull { table, column }
        });
    }
    Ok(())
}

fn rename_table(
    work: &mut WorkingSet,
    from: &TableId,
    to: &TableId,
    statements: &mut Vec<TargetDdl>,
) -> Result<(), String> {
    let Some(mut schema) = work.get(from) else {
        if work.get(to).is_some() {
            return Ok(());
        }
        return Err(format!("table {} is not known", from));
    };
    if work.get(to).is_some() {
        return Err(format!("table {} already exists", to));
    }
    if from.schema != to.schema {
        return Err("moving a table between databases is not supported".to_string());
    }
    work.remove(from);
    schema.table = to.clone();
    work.put(schema);
    statements.push(TargetDdl::RenameTable {
        from: from.clone(),
        to: to.clone(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourcePosition;

    fn translator() -> (Arc<SchemaRegistry>, DdlTranslator) {
        let registry = Arc::new(SchemaRegistry::new());
        let translator = DdlTranslator::new(registry.clone(), "shop");
        (registry, translator)
    }

    fn run(translator: &DdlTranslator, sql: &str) -> Result<Translation, DdlError> {
        let event = DdlEvent {
            database: None,
            statement: sql.to_string(),
            position: SourcePosition::from_index(0),
        };
        let parsed = translator.parse(&event)?;
        translator.translate(&parsed)
    }

    fn items() -> TableId {
        TableId::new("shop", "items")
    }

    #[test]
    fn test_create_table_registers_schema() {
        let (registry, translator) = translator();
        let translation = run(
            &translator,
            "CREATE TABLE items (id INT PRIMARY KEY, qty SMALLINT, price DECIMAL(8,2))",
        )
        .unwrap();

        assert_eq!(translation.statements.len(), 2);
        assert!(matches!(translation.statements[0], TargetDdl::CreateSchema(ref s) if s == "shop"));
        let schema = registry.get(&items()).unwrap();
        assert_eq!(schema.primary_key, vec!["id"]);
        assert!(!schema.column("id").unwrap().nullable);
        assert_eq!(
            schema.column("price").unwrap().target_type,
            TargetType::Decimal { precision: 8, scale: 2 }
        );
    }

    #[test]
    fn test_replayed_statements_are_noops() {
        let (_registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY)").unwrap();
        run(&translator, "ALTER TABLE items ADD COLUMN note TEXT").unwrap();

        assert!(run(&translator, "CREATE TABLE items (id INT PRIMARY KEY)").unwrap().is_empty());
        assert!(run(&translator, "ALTER TABLE items ADD COLUMN note TEXT").unwrap().is_empty());
        assert!(run(&translator, "ALTER TABLE items DROP COLUMN missing").unwrap().is_empty());
    }

    #[test]
    fn test_widening_and_nullability() {
        let (registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY, qty SMALLINT)").unwrap();

        let translation = run(&translator, "ALTER TABLE items MODIFY qty BIGINT NOT NULL").unwrap();
        assert_eq!(
            translation.statements,
            vec![
                TargetDdl::AlterColumnType {
                    table: items(),
                    column: "qty".to_string(),
                    target_type: TargetType::BigInt
                },
                TargetDdl::SetNotNull {
                    table: items(),
                    column: "qty".to_string()
                },
            ]
        );
        let qty = registry.get(&items()).unwrap().column("qty").cloned().unwrap();
        assert_eq!(qty.target_type, TargetType::BigInt);
        assert!(!qty.nullable);
    }

    #[test]
    fn test_narrowing_leaves_registry_unchanged() {
        let (registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY, qty BIGINT, note TEXT)").unwrap();
        let before = registry.get(&items()).unwrap();

        let err = run(
            &translator,
            "ALTER TABLE items ADD COLUMN extra INT, MODIFY qty TINYINT",
        )
        .unwrap_err();

        assert!(matches!(err, DdlError::Unsupported { table: Some(ref t), .. } if *t == items()));
        assert_eq!(registry.get(&items()).unwrap(), before);
    }

    #[test]
    fn test_key_columns_are_protected() {
        let (_registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY, qty INT)").unwrap();

        assert!(run(&translator, "ALTER TABLE items DROP COLUMN id").is_err());
        assert!(run(&translator, "ALTER TABLE items MODIFY id BIGINT").is_err());
        assert!(run(&translator, "ALTER TABLE items ADD COLUMN _version INT").is_err());
    }

    #[test]
    fn test_rename_column_and_table() {
        let (registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY, qty INT)").unwrap();

        run(&translator, "ALTER TABLE items CHANGE qty quantity INT").unwrap();
        assert!(registry.get(&items()).unwrap().has_column("quantity"));

        let translation = run(&translator, "RENAME TABLE items TO goods").unwrap();
        assert_eq!(
            translation.statements,
            vec![TargetDdl::RenameTable {
                from: items(),
                to: TableId::new("shop", "goods")
            }]
        );
        assert!(registry.get(&items()).is_none());
        assert!(registry.get(&TableId::new("shop", "goods")).is_some());

        // replay after the rename already happened
        assert!(run(&translator, "RENAME TABLE items TO goods").unwrap().is_empty());
    }

    #[test]
    fn test_drop_table() {
        let (registry, translator) = translator();
        run(&translator, "CREATE TABLE items (id INT PRIMARY KEY)").unwrap();
        let translation = run(&translator, "DROP TABLE items").unwrap();
        assert_eq!(translation.statements, vec![TargetDdl::DropTable(items())]);
        assert!(registry.is_empty());
    }
}
