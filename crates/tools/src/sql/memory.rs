//! A small in-process SQL engine for local mode and tests.
//!
//! It understands enough of a dump to materialize tables (`CREATE TABLE`,
//! `INSERT INTO ... VALUES`, `COPY ... FROM stdin`) and answers `SELECT cols | * | COUNT(*) FROM t [LIMIT n]`.
//! Every other statement is accepted on load and ignored.

use crate::sql::catalog::{QueryRows, SqlCatalog, SqlServers, TableColumn, TableSchema, read_only_statement};
use crate::sql::dump::{DumpStatement, is_safe_identifier};
use async_trait::async_trait;
use docchat_core::chat::SqlDialect;
use docchat_core::error::ToolError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?([`"\w.]+)\s*\((.*)\)[^)]*$"#)
        .expect("create table regex is valid")
});
static INSERT_INTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^INSERT\s+INTO\s+([`"\w.]+)\s*(?:\(([^)]*)\))?\s*VALUES\s*(.*)$"#)
        .expect("insert regex is valid")
});
static COPY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^COPY\s+([`"\w.]+)\s*(?:\(([^)]*)\))?\s*FROM\s+stdin"#).expect("copy regex is valid")
});
static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^SELECT\s+(.+?)\s+FROM\s+([`"\w.]+)(?:\s+LIMIT\s+(\d+))?$"#)
        .expect("select regex is valid")
});

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Vec<String>>,
}

#[derive(Debug)]
struct MemoryDatabase {
    name: String,
    dialect: SqlDialect,
    tables: RwLock<Vec<MemoryTable>>,
}

/// Dump databases held in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySqlServers {
    databases: Arc<RwLock<HashMap<String, Arc<MemoryDatabase>>>>,
}

impl MemorySqlServers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the databases currently provisioned.
    pub async fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn database(&self, name: &str) -> Result<Arc<MemoryDatabase>, ToolError> {
        self.databases
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(format!("database {name}")))
    }
}

fn unquote(ident: &str) -> String {
    let last = ident.rsplit('.').next().unwrap_or(ident);
    last.trim_matches(|c| c == '`' || c == '"').to_string()
}

/// Split on commas outside parentheses and quotes.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == '\\' {
                    if let Some(n) = chars.next() {
                        current.push(n);
                    }
                } else if c == q {
                    if chars.peek() == Some(&q) {
                        if let Some(n) = chars.next() {
                            current.push(n);
                        }
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                ',' if depth == 0 => parts.push(std::mem::take(&mut current).trim().to_string()),
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_columns(body: &str) -> Vec<TableColumn> {
    const CONSTRAINTS: [&str; 7] = ["PRIMARY", "KEY", "UNIQUE", "CONSTRAINT", "INDEX", "FOREIGN", "CHECK"];
    split_top_level(body)
        .into_iter()
        .filter_map(|part| {
            let mut words = part.split_whitespace();
            let name = words.next()?;
            if CONSTRAINTS.contains(&name.to_uppercase().as_str()) {
                return None;
            }
            Some(TableColumn {
                name: unquote(name),
                data_type: words.next().unwrap_or("text").to_lowercase(),
            })
        })
        .collect()
}

fn parse_value(raw: &str) -> String {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("NULL") {
        return "NULL".to_string();
    }
    match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'").replace("\\'", "'"),
        None => raw.to_string(),
    }
}

fn parse_tuples(values: &str) -> Vec<Vec<String>> {
    split_top_level(values)
        .into_iter()
        .filter_map(|tuple| {
            let inner = tuple.trim().strip_prefix('(')?.strip_suffix(')')?.to_string();
            Some(split_top_level(&inner).iter().map(|v| parse_value(v)).collect())
        })
        .collect()
}

/// One field of COPY text format: `\N` is NULL, backslash escapes are undone.
fn copy_field(raw: &str) -> String {
    if raw == "\\N" {
        return "NULL".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

impl MemoryDatabase {
    async fn apply(&self, statement: &str) {
        if let Some(caps) = CREATE_TABLE_RE.captures(statement) {
            let name = unquote(&caps[1]);
            let columns = parse_columns(&caps[2]);
            let mut tables = self.tables.write().await;
            tables.retain(|t| t.schema.name != name);
            tables.push(MemoryTable {
                schema: TableSchema { name, columns },
                rows: Vec::new(),
            });
        } else if let Some(caps) = INSERT_INTO_RE.captures(statement) {
            let name = unquote(&caps[1]);
            let rows = parse_tuples(&caps[3]);
            let mut tables = self.tables.write().await;
            if let Some(table) = tables.iter_mut().find(|t| t.schema.name == name) {
                let width = table.schema.columns.len();
                table.rows.extend(rows.into_iter().map(|mut r| {
                    r.resize(width, "NULL".to_string());
                    r
                }));
            }
        }
    }

    async fn copy_in(&self, command: &str, data: &str) {
        let Some(caps) = COPY_RE.captures(command) else {
            return;
        };
        let name = unquote(&caps[1]);
        let listed: Option<Vec<String>> = caps
            .get(2)
            .map(|cols| cols.as_str().split(',').map(|c| unquote(c.trim())).collect());
        let mut tables = self.tables.write().await;
        let Some(table) = tables.iter_mut().find(|t| t.schema.name == name) else {
            return;
        };
        // Position of each COPY field in the table's column order.
        let positions: Vec<Option<usize>> = match &listed {
            Some(cols) => cols
                .iter()
                .map(|c| table.schema.columns.iter().position(|tc| &tc.name == c))
                .collect(),
            None => (0..table.schema.columns.len()).map(Some).collect(),
        };
        let width = table.schema.columns.len();
        for line in data.lines().filter(|l| !l.is_empty()) {
            let mut row = vec!["NULL".to_string(); width];
            for (field, position) in line.split('\t').zip(&positions) {
                if let Some(i) = position {
                    row[*i] = copy_field(field);
                }
            }
            table.rows.push(row);
        }
    }
}

#[async_trait]
impl SqlServers for MemorySqlServers {
    async fn provision(&self, dialect: SqlDialect, database: &str) -> Result<(), ToolError> {
        if !is_safe_identifier(database) {
            return Err(ToolError::InvalidArguments(format!("unsafe database name '{database}'")));
        }
        if dialect == SqlDialect::Unknown {
            return Err(ToolError::InvalidArguments("no server configured for Unknown dumps".into()));
        }
        self.databases
            .write()
            .await
            .entry(database.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryDatabase {
                    name: database.to_string(),
                    dialect,
                    tables: RwLock::new(Vec::new()),
                })
            });
        Ok(())
    }

    async fn load(
        &self,
        _dialect: SqlDialect,
        database: &str,
        statements: &[DumpStatement],
    ) -> Result<usize, ToolError> {
        let db = self.database(database).await?;
        for statement in statements {
            match statement {
                DumpStatement::Sql(sql) => db.apply(sql).await,
                DumpStatement::CopyFromStdin { command, data } => db.copy_in(command, data).await,
            }
        }
        Ok(statements.len())
    }

    async fn drop_database(&self, _dialect: SqlDialect, database: &str) -> Result<(), ToolError> {
        self.databases.write().await.remove(database);
        Ok(())
    }

    async fn open(&self, _dialect: SqlDialect, database: &str) -> Result<Arc<dyn SqlCatalog>, ToolError> {
        let db = self.database(database).await?;
        Ok(Arc::new(MemoryCatalog { db }))
    }
}

struct MemoryCatalog {
    db: Arc<MemoryDatabase>,
}

#[async_trait]
impl SqlCatalog for MemoryCatalog {
    fn database_name(&self) -> &str {
        &self.db.name
    }

    fn dialect(&self) -> SqlDialect {
        self.db.dialect
    }

    async fn list_tables(&self) -> Result<Vec<String>, ToolError> {
        let mut names: Vec<String> = self
            .db
            .tables
            .read()
            .await
            .iter()
            .map(|t| t.schema.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn describe_table(&self, table: &str) -> Result<TableSchema, ToolError> {
        self.db
            .tables
            .read()
            .await
            .iter()
            .find(|t| t.schema.name == table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| ToolError::NotFound(format!("table {table}")))
    }

    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError> {
        let statement = read_only_statement(sql)?;
        let caps = SELECT_RE.captures(statement).ok_or_else(|| ToolError::ExecutionFailed {
            tool_name: "sql".into(),
            reason: "the in-memory engine only answers SELECT <columns> FROM <table> [LIMIT n]".into(),
        })?;
        let name = unquote(&caps[2]);
        let limit = caps
            .get(3)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(max_rows)
            .min(max_rows);

        let tables = self.db.tables.read().await;
        let table = tables
            .iter()
            .find(|t| t.schema.name.eq_ignore_ascii_case(&name))
            .ok_or_else(|| ToolError::ExecutionFailed {
                tool_name: "sql".into(),
                reason: format!("no such table: {name}"),
            })?;

        let projection = caps[1].trim();
        if projection.eq_ignore_ascii_case("COUNT(*)") {
            return Ok(QueryRows {
                columns: vec!["count".into()],
                rows: vec![vec![table.rows.len().to_string()]],
            });
        }

        let indices: Vec<usize> = if projection == "*" {
            (0..table.schema.columns.len()).collect()
        } else {
            split_top_level(projection)
                .iter()
                .map(|c| {
                    let c = unquote(c);
                    table
                        .schema
                        .columns
                        .iter()
                        .position(|col| col.name.eq_ignore_ascii_case(&c))
                        .ok_or_else(|| ToolError::ExecutionFailed {
                            tool_name: "sql".into(),
                            reason: format!("no such column: {c}"),
                        })
                })
                .collect::<Result<_, _>>()?
        };

        Ok(QueryRows {
            columns: indices.iter().map(|&i| table.schema.columns[i].name.clone()).collect(),
            rows: table
                .rows
                .iter()
                .take(limit)
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }
}
