//! A forgiving parser for the MySQL statements a replication log carries.
//!
//! Statements are tokenized with the MySQL dialect of `sqlparser`, which
//! deals with quoting, comments and nesting. Only the structural parts of a
//! statement are understood. Indexes, constraints, table options and
//! everything that is not a table definition parse to [`DdlCommand::Ignored`].

use super::DdlError;
use crate::event::TableId;
use regex::Regex;
use sqlparser::dialect::MySqlDialect;
use sqlparser::tokenizer::{Token, TokenWithSpan, Tokenizer, Word};
use std::sync::OnceLock;

/// A column definition as written in the source dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub type_args: Option<String>,
    pub unsigned: bool,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterAction {
    AddColumn(ColumnDef),
    DropColumn(String),
    RenameColumn { from: String, to: String },
    ChangeColumn { from: String, column: ColumnDef },
    ModifyColumn(ColumnDef),
    RenameTable(TableId),
    /// Index, constraint or option clauses with no effect on columns.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlCommand {
    CreateDatabase(String),
    CreateTable {
        table: TableId,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    AlterTable {
        table: TableId,
        actions: Vec<AlterAction>,
    },
    RenameTables(Vec<(TableId, TableId)>),
    DropTables(Vec<TableId>),
    Truncate(TableId),
    Ignored,
}

/// A parsed statement, ready for translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDdl {
    pub statement: String,
    pub command: DdlCommand,
}

impl ParsedDdl {
    /// Tables whose buffered data must be flushed before this statement applies.
    pub fn tables(&self) -> Vec<TableId> {
        match &self.command {
            DdlCommand::CreateTable { table, .. } | DdlCommand::Truncate(table) => {
                vec![table.clone()]
            }
            DdlCommand::AlterTable { table, actions } => {
                let mut tables = vec![table.clone()];
                for action in actions {
                    if let AlterAction::RenameTable(to) = action {
                        tables.push(to.clone());
                    }
                }
                tables
            }
            DdlCommand::RenameTables(pairs) => pairs
                .iter()
                .flat_map(|(from, to)| [from.clone(), to.clone()])
                .collect(),
            DdlCommand::DropTables(tables) => tables.clone(),
            DdlCommand::CreateDatabase(_) | DdlCommand::Ignored => Vec::new(),
        }
    }
}

/// Parse one statement. `database` qualifies unqualified table names.
pub fn parse_statement(statement: &str, database: &str) -> Result<ParsedDdl, DdlError> {
    let statement = statement.trim();
    let unsupported = |table: Option<TableId>, reason: String| DdlError::Unsupported {
        table,
        reason,
        statement: statement.to_string(),
    };

    let command = match tokenize(statement) {
        Ok(tokens) => parse_command(Cursor::new(&tokens), database)
            .map_err(|(table, reason)| unsupported(table, reason))?,
        Err(_) if !looks_structural(statement) => DdlCommand::Ignored,
        Err(reason) => return Err(unsupported(None, reason)),
    };

    Ok(ParsedDdl {
        statement: statement.to_string(),
        command,
    })
}

/// Significant tokens: no whitespace, comments or trailing semicolons.
fn tokenize(statement: &str) -> Result<Vec<Token>, String> {
    let dialect = MySqlDialect {};
    let tokens: Vec<TokenWithSpan> = Tokenizer::new(&dialect, statement)
        .tokenize_with_location()
        .map_err(|e| e.to_string())?;
    let mut tokens: Vec<Token> = tokens
        .into_iter()
        .map(|t| t.token)
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    while matches!(tokens.last(), Some(Token::SemiColon)) {
        tokens.pop();
    }
    Ok(tokens)
}

/// Whether a statement the tokenizer rejected would change a table.
fn looks_structural(statement: &str) -> bool {
    static STRUCTURAL: OnceLock<Regex> = OnceLock::new();
    STRUCTURAL
        .get_or_init(|| {
            Regex::new(
                r"(?is)^\s*(?:/\*.*?\*/\s*)*(?:create\s+(?:temporary\s+)?table|alter\s+(?:online\s+|ignore\s+)*table|rename\s+tables?|drop\s+(?:temporary\s+)?tables?|truncate)\b",
            )
            .expect("static DDL pattern")
        })
        .is_match(statement)
}

type ParseFailure = (Option<TableId>, String);

fn parse_command(mut cur: Cursor<'_>, database: &str) -> Result<DdlCommand, ParseFailure> {
    if cur.eat_keyword("create") {
        if cur.eat_keyword("database") || cur.eat_keyword("schema") {
            cur.eat_keywords(&["if", "not", "exists"]);
            return cur
                .ident()
                .map(DdlCommand::CreateDatabase)
                .ok_or_else(|| (None, "CREATE DATABASE without a name".to_string()));
        }
        cur.eat_keyword("temporary");
        if !cur.eat_keyword("table") {
            return Ok(DdlCommand::Ignored);
        }
        cur.eat_keywords(&["if", "not", "exists"]);
        let table = cur
            .table(database)
            .ok_or_else(|| (None, "CREATE TABLE without a name".to_string()))?;
        return parse_create_table(table.clone(), cur).map_err(|reason| (Some(table), reason));
    }

    if cur.eat_keyword("alter") {
        while cur.eat_keyword("online") || cur.eat_keyword("ignore") {}
        if !cur.eat_keyword("table") {
            return Ok(DdlCommand::Ignored);
        }
        let table = cur
            .table(database)
            .ok_or_else(|| (None, "ALTER TABLE without a name".to_string()))?;
        let actions = split_commas(cur.rest())
            .into_iter()
            .map(|clause| parse_alter_action(clause, database))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| (Some(table.clone()), reason))?;
        return Ok(DdlCommand::AlterTable { table, actions });
    }

    if cur.eat_keyword("rename") {
        if !(cur.eat_keyword("table") || cur.eat_keyword("tables")) {
            return Ok(DdlCommand::Ignored);
        }
        let mut pairs = Vec::new();
        for clause in split_commas(cur.rest()) {
            let pair = rename_pair(clause, database)
                .ok_or_else(|| (None, format!("cannot read rename clause '{}'", render(clause))))?;
            pairs.push(pair);
        }
        if pairs.is_empty() {
            return Err((None, "RENAME TABLE without tables".to_string()));
        }
        return Ok(DdlCommand::RenameTables(pairs));
    }

    if cur.eat_keyword("drop") {
        cur.eat_keyword("temporary");
        if !(cur.eat_keyword("table") || cur.eat_keyword("tables")) {
            return Ok(DdlCommand::Ignored);
        }
        cur.eat_keywords(&["if", "exists"]);
        // A trailing RESTRICT or CASCADE is left unread.
        let tables = split_commas(cur.rest())
            .into_iter()
            .map(|clause| {
                Cursor::new(clause)
                    .table(database)
                    .ok_or_else(|| (None, format!("cannot read table '{}'", render(clause))))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(DdlCommand::DropTables(tables));
    }

    if cur.eat_keyword("truncate") {
        cur.eat_keyword("table");
        return cur
            .table(database)
            .map(DdlCommand::Truncate)
            .ok_or_else(|| (None, "TRUNCATE without a table".to_string()));
    }

    Ok(DdlCommand::Ignored)
}

fn rename_pair(clause: &[Token], database: &str) -> Option<(TableId, TableId)> {
    let mut cur = Cursor::new(clause);
    let from = cur.table(database)?;
    if !cur.eat_keyword("to") {
        return None;
    }
    let to = cur.table(database)?;
    cur.is_done().then_some((from, to))
}

fn parse_create_table(table: TableId, mut cur: Cursor<'_>) -> Result<DdlCommand, String> {
    if cur.at_keyword("like") {
        return Err("CREATE TABLE ... LIKE is not supported".to_string());
    }
    let body = cur
        .group()
        .ok_or_else(|| "CREATE TABLE without a column list is not supported".to_string())?;

    let mut columns = Vec::new();
    let mut primary_key = Vec::new();

    for element in split_commas(body) {
        if let Some(keys) = table_primary_key(element)? {
            primary_key = keys;
            continue;
        }
        if is_table_constraint(element) {
            continue;
        }
        let column = parse_column_def(element)?;
        if column.primary_key {
            primary_key = vec![column.name.clone()];
        }
        columns.push(column);
    }

    if columns.is_empty() {
        return Err("table has no columns".to_string());
    }

    Ok(DdlCommand::CreateTable {
        table,
        columns,
        primary_key,
    })
}

/// `PRIMARY KEY (a, b)` with an optional `CONSTRAINT name` prefix.
fn table_primary_key(element: &[Token]) -> Result<Option<Vec<String>>, String> {
    let mut cur = Cursor::new(element);
    if cur.eat_keyword("constraint") && !cur.at_keyword("primary") {
        cur.ident();
    }
    if !cur.eat_keywords(&["primary", "key"]) {
        return Ok(None);
    }
    if cur.eat_keyword("using") {
        cur.ident();
    }
    let list = cur
        .group()
        .ok_or_else(|| "primary key without column list".to_string())?;
    // Prefix lengths and sort order follow the name: `name`(10) DESC
    let keys = split_commas(list)
        .into_iter()
        .map(|key| {
            Cursor::new(key)
                .ident()
                .ok_or_else(|| format!("cannot read key column '{}'", render(key)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(keys))
}

fn is_table_constraint(element: &[Token]) -> bool {
    let first = keyword_at(element, 0);
    ["key", "index", "unique", "fulltext", "spatial", "constraint", "foreign", "check"]
        .contains(&first.as_str())
}

fn parse_alter_action(clause: &[Token], database: &str) -> Result<AlterAction, String> {
    let first = keyword_at(clause, 0);
    let second = keyword_at(clause, 1);
    let unreadable = || format!("cannot read '{}'", render(clause));
    let mut cur = Cursor::new(clause);

    match first.as_str() {
        "add" => {
            if second == "primary" || (second == "constraint" && has_pair(clause, "primary", "key")) {
                return Err("changing the primary key is not supported".to_string());
            }
            if matches!(
                second.as_str(),
                "index" | "key" | "unique" | "fulltext" | "spatial" | "constraint" | "foreign"
                    | "check" | "partition"
            ) {
                return Ok(AlterAction::Ignored);
            }
            cur.eat_keyword("add");
            cur.eat_keyword("column");
            if cur.peek() == Some(&Token::LParen) {
                return Err("adding several columns in one clause is not supported".to_string());
            }
            Ok(AlterAction::AddColumn(parse_column_def(strip_position(cur.rest()))?))
        }
        "drop" => {
            if second == "primary" {
                return Err("dropping the primary key is not supported".to_string());
            }
            if matches!(
                second.as_str(),
                "index" | "key" | "foreign" | "check" | "constraint" | "partition"
            ) {
                return Ok(AlterAction::Ignored);
            }
            cur.eat_keyword("drop");
            cur.eat_keyword("column");
            let name = cur.ident().ok_or_else(|| "DROP without a column".to_string())?;
            Ok(AlterAction::DropColumn(name))
        }
        "rename" => match second.as_str() {
            "column" => {
                cur.eat_keywords(&["rename", "column"]);
                let from = cur.ident().ok_or_else(unreadable)?;
                if !cur.eat_keyword("to") {
                    return Err(unreadable());
                }
                let to = cur.ident().ok_or_else(unreadable)?;
                if !cur.is_done() {
                    return Err(unreadable());
                }
                Ok(AlterAction::RenameColumn { from, to })
            }
            "index" | "key" => Ok(AlterAction::Ignored),
            _ => {
                cur.eat_keyword("rename");
                let _ = cur.eat_keyword("to") || cur.eat_keyword("as");
                cur.table(database)
                    .map(AlterAction::RenameTable)
                    .ok_or_else(unreadable)
            }
        },
        "change" => {
            cur.eat_keyword("change");
            cur.eat_keyword("column");
            let from = cur.ident().ok_or_else(unreadable)?;
            if cur.is_done() {
                return Err(unreadable());
            }
            Ok(AlterAction::ChangeColumn {
                from,
                column: parse_column_def(strip_position(cur.rest()))?,
            })
        }
        "modify" => {
            cur.eat_keyword("modify");
            cur.eat_keyword("column");
            Ok(AlterAction::ModifyColumn(parse_column_def(strip_position(cur.rest()))?))
        }
        // ALTER [COLUMN] c SET DEFAULT .. / DROP DEFAULT / SET [IN]VISIBLE
        "alter" => {
            if ["default", "visible", "invisible"].iter().any(|kw| has_keyword(clause, kw)) {
                Ok(AlterAction::Ignored)
            } else {
                Err(unreadable())
            }
        }
        "engine" | "auto_increment" | "default" | "character" | "charset" | "collate"
        | "comment" | "row_format" | "algorithm" | "lock" | "force" | "order" | "enable"
        | "disable" | "convert" | "key_block_size" | "stats_persistent" | "with"
        | "without" | "partition" | "remove" | "coalesce" | "reorganize" | "analyze"
        | "optimize" | "rebuild" | "repair" | "check" | "discard" | "import" | "truncate"
        | "exchange" | "upgrade" | "validation" => Ok(AlterAction::Ignored),
        _ => Err(unreadable()),
    }
}

fn parse_column_def(tokens: &[Token]) -> Result<ColumnDef, String> {
    let mut cur = Cursor::new(tokens);
    let name = cur
        .ident()
        .ok_or_else(|| format!("cannot read column '{}'", render(tokens)))?;

    let type_name = keyword_at(cur.rest(), 0);
    if type_name.is_empty() {
        return Err(format!("column '{}' has no type", name));
    }
    cur.advance();

    let mut type_args = None;
    if cur.peek() == Some(&Token::LParen) {
        let args = cur
            .group()
            .ok_or_else(|| format!("unbalanced type of '{}'", name))?;
        type_args = Some(args.iter().map(ToString::to_string).collect::<String>());
    }

    // Literals are separate tokens, so `COMMENT 'not null'` is not an attribute.
    let attrs = cur.rest();
    let primary_key = has_pair(attrs, "primary", "key")
        || (has_keyword(attrs, "key") && !has_keyword(attrs, "unique"));
    let nullable = !has_pair(attrs, "not", "null") && !primary_key;

    Ok(ColumnDef {
        name,
        type_name,
        type_args,
        unsigned: has_keyword(attrs, "unsigned"),
        nullable,
        primary_key,
    })
}

/// Drop a trailing `FIRST` or `AFTER col` from a column clause.
fn strip_position(tokens: &[Token]) -> &[Token] {
    match tokens {
        [head @ .., last] if is_keyword(last, "first") => head,
        [head @ .., after, Token::Word(_)] if is_keyword(after, "after") => head,
        _ => tokens,
    }
}

/// Unquoted word matching `keyword`, case-insensitively.
fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(
        token,
        Token::Word(Word { value, quote_style: None, .. }) if value.eq_ignore_ascii_case(keyword)
    )
}

/// Lowercased unquoted word at `index`, or empty.
fn keyword_at(tokens: &[Token], index: usize) -> String {
    match tokens.get(index) {
        Some(Token::Word(Word {
            value,
            quote_style: None,
            ..
        })) => value.to_ascii_lowercase(),
        _ => String::new(),
    }
}

fn has_keyword(tokens: &[Token], keyword: &str) -> bool {
    tokens.iter().any(|t| is_keyword(t, keyword))
}

fn has_pair(tokens: &[Token], first: &str, second: &str) -> bool {
    tokens
        .windows(2)
        .any(|w| is_keyword(&w[0], first) && is_keyword(&w[1], second))
}

/// Split on commas outside parentheses. Empty parts are dropped.
fn split_commas(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Comma if depth == 0 => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts.retain(|part| !part.is_empty());
    parts
}

fn render(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read position over the significant tokens of one statement.
#[derive(Debug, Clone, Copy)]
struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos = (self.pos + 1).min(self.tokens.len());
    }

    fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn rest(&self) -> &'a [Token] {
        &self.tokens[self.pos.min(self.tokens.len())..]
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| is_keyword(t, keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    /// Consume the whole keyword sequence or nothing.
    fn eat_keywords(&mut self, keywords: &[&str]) -> bool {
        let start = self.pos;
        for keyword in keywords {
            if !self.eat_keyword(keyword) {
                self.pos = start;
                return false;
            }
        }
        true
    }

    fn eat(&mut self, token: &Token) -> bool {
        let found = self.peek() == Some(token);
        if found {
            self.advance();
        }
        found
    }

    /// An identifier, quoted or not.
    fn ident(&mut self) -> Option<String> {
        let name = match self.peek()? {
            Token::Word(word) => word.value.clone(),
            Token::DoubleQuotedString(name) => name.clone(),
            _ => return None,
        };
        self.advance();
        Some(name)
    }

    /// `name` or `schema.name`; unqualified names land in `database`.
    fn table(&mut self, database: &str) -> Option<TableId> {
        let first = self.ident()?;
        if self.eat(&Token::Period) {
            let name = self.ident()?;
            return Some(TableId::new(first, name));
        }
        Some(TableId::new(database, first))
    }

    /// Tokens inside the parenthesised group that starts here; moves past it.
    fn group(&mut self) -> Option<&'a [Token]> {
        if self.peek() != Some(&Token::LParen) {
            return None;
        }
        let open = self.pos;
        let mut depth = 0usize;
        for (offset, token) in self.tokens[open..].iter().enumerate() {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let close = open + offset;
                        self.pos = close + 1;
                        return Some(&self.tokens[open + 1..close]);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
