pub mod parser;
pub mod translator;

use crate::event::TableId;
use thiserror::Error;

pub use parser::{parse_statement, AlterAction, ColumnDef, DdlCommand, ParsedDdl};
pub use translator::{DdlTranslator, TargetDdl, Translation};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DdlError {
    #[error("unsupported DDL ({reason}): {statement}")]
    Unsupported {
        table: Option<TableId>,
        reason: String,
        statement: String,
    },
}

impl DdlError {
    pub fn table(&self) -> Option<&TableId> {
        match self {
            DdlError::Unsupported { table, .. } => table.as_ref(),
        }
    }
}
