pub mod registry;
pub mod types;

pub use registry::{
    is_reserved_column, ColumnSchema, RegistryChange, SchemaRegistry, TableSchema, DELETED_COLUMN,
    VERSION_COLUMN,
};
pub use types::{TargetType, TypeError};
