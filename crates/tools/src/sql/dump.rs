//! SQL dump inspection: dialect detection, statement splitting, database naming.

use docchat_core::chat::SqlDialect;
use std::path::Path;

const MYSQL_KEYWORDS: [&str; 5] = ["ENGINE=", "AUTO_INCREMENT", "UNLOCK TABLES", "LOCK TABLES", "CHARSET="];
const POSTGRES_KEYWORDS: [&str; 5] = ["SET SEARCH_PATH", "SERIAL PRIMARY KEY", "RETURNING", "BIGSERIAL", "NOW()"];

/// Detect which engine a dump was written for.
///
/// Lines are scanned in order, trimmed and upper-cased; the first line carrying a
/// characteristic keyword decides. MySQL keywords are checked before Postgres
/// keywords on each line.
pub fn detect_sql_dump_type(text: &str) -> SqlDialect {
    for line in text.lines() {
        let line = line.trim().to_uppercase();
        if MYSQL_KEYWORDS.iter().any(|k| line.contains(k)) {
            return SqlDialect::MySql;
        }
        if POSTGRES_KEYWORDS.iter().any(|k| line.contains(k)) {
            return SqlDialect::Postgres;
        }
    }
    SqlDialect::Unknown
}

/// Read a dump from disk (invalid UTF-8 replaced) and detect its dialect.
pub async fn detect_sql_dump_file(path: &Path) -> std::io::Result<SqlDialect> {
    let bytes = tokio::fs::read(path).await?;
    Ok(detect_sql_dump_type(&String::from_utf8_lossy(&bytes)))
}

/// Name of the isolated database a dump file is materialized into.
pub fn dump_database_name(file_id: &str) -> String {
    let suffix: String = file_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("dump_{suffix}")
}

/// True for names safe to interpolate as a database identifier.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// One unit of a dump script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpStatement {
    /// A statement executed as written.
    Sql(String),
    /// `COPY ... FROM stdin` with its data rows, terminator excluded.
    CopyFromStdin { command: String, data: String },
}

impl DumpStatement {
    /// The SQL text, without any COPY data.
    pub fn command(&self) -> &str {
        match self {
            Self::Sql(sql) => sql,
            Self::CopyFromStdin { command, .. } => command,
        }
    }
}

/// Split a dump script into executable statements.
///
/// Semicolons inside quotes and comments do not split. `CREATE DATABASE` and `USE`
/// statements are dropped so the dump lands in the database chosen for it, as are
/// psql meta-commands. `COPY ... FROM stdin` keeps its data rows, which run until
/// a line holding only `\.`. Statements made of comments only are dropped; MySQL
/// `/*! ... */` conditional comments are kept.
pub fn split_statements(script: &str) -> Vec<DumpStatement> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut significant = false;
    let mut chars = script.chars().peekable();
    let mut at_line_start = true;
    let mut copy: Option<(String, String)> = None;

    while let Some(c) = chars.next() {
        if copy.is_some() {
            let mut line = String::new();
            if c != '\n' {
                line.push(c);
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                    line.push(n);
                }
            }
            if line.trim_end_matches('\r') == "\\." {
                if let Some((command, data)) = copy.take() {
                    statements.push(DumpStatement::CopyFromStdin { command, data });
                }
                at_line_start = true;
            } else if let Some((_, data)) = copy.as_mut() {
                data.push_str(&line);
                data.push('\n');
            }
            continue;
        }

        if at_line_start && c == '\\' {
            while let Some(&n) = chars.peek() {
                chars.next();
                if n == '\n' {
                    break;
                }
            }
            continue;
        }
        at_line_start = c == '\n';

        match c {
            '\'' | '"' | '`' => {
                significant = true;
                current.push(c);
                while let Some(n) = chars.next() {
                    current.push(n);
                    if n == '\\' && c == '\'' {
                        if let Some(escaped) = chars.next() {
                            current.push(escaped);
                        }
                        continue;
                    }
                    if n == c {
                        if chars.peek() == Some(&c) {
                            if let Some(doubled) = chars.next() {
                                current.push(doubled);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        current.push('\n');
                        at_line_start = true;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let conditional = chars.peek() == Some(&'!');
                let mut body = String::from("/*");
                let mut prev = '\0';
                for n in chars.by_ref() {
                    body.push(n);
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                if conditional {
                    significant = true;
                    current.push_str(&body);
                }
            }
            ';' => {
                let statement = current.trim().to_string();
                if significant && keep_statement(&statement) {
                    if is_copy_from_stdin(&statement) {
                        // Data starts on the next line.
                        for n in chars.by_ref() {
                            if n == '\n' {
                                break;
                            }
                        }
                        copy = Some((statement, String::new()));
                    } else {
                        statements.push(DumpStatement::Sql(statement));
                    }
                }
                current.clear();
                significant = false;
            }
            _ => {
                if !c.is_whitespace() {
                    significant = true;
                }
                current.push(c);
            }
        }
    }

    // A block cut off before its terminator still carries its rows.
    if let Some((command, data)) = copy {
        statements.push(DumpStatement::CopyFromStdin { command, data });
        return statements;
    }
    let tail = current.trim().to_string();
    if significant && keep_statement(&tail) && !is_copy_from_stdin(&tail) {
        statements.push(DumpStatement::Sql(tail));
    }
    statements
}

fn keep_statement(statement: &str) -> bool {
    let upper = statement.to_uppercase();
    let words: Vec<&str> = upper.split_whitespace().take(2).collect();
    !matches!(words.as_slice(), ["CREATE", "DATABASE", ..] | ["USE", ..])
}

fn is_copy_from_stdin(statement: &str) -> bool {
    let upper = statement.to_uppercase();
    upper.starts_with("COPY ") && upper.contains("FROM STDIN")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MYSQL_DUMP: &str = "-- MySQL dump 10.13\n\
        /*!40101 SET NAMES utf8 */;\n\
        CREATE DATABASE shop;\n\
        USE shop;\n\
        DROP TABLE IF EXISTS `orders`;\n\
        CREATE TABLE `orders` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `note` text\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4;\n\
        LOCK TABLES `orders` WRITE;\n\
        INSERT INTO `orders` VALUES (1,'a;b'),(2,'it''s');\n\
        UNLOCK TABLES;\n";

    const PG_DUMP: &str = "--\n-- PostgreSQL database dump\n--\n\
        SET search_path = public, pg_catalog;\n\
        \\connect shop\n\
        CREATE TABLE customers (id BIGSERIAL PRIMARY KEY, name text);\n\
        COPY public.customers (id, name) FROM stdin;\n\
        1\tAda; Lovelace\n\
        \\.\n\
        INSERT INTO customers (name) VALUES ('Alan') RETURNING id;\n";

    #[test]
    fn detects_mysql_and_postgres() {
        assert_eq!(detect_sql_dump_type(MYSQL_DUMP), SqlDialect::MySql);
        assert_eq!(detect_sql_dump_type(PG_DUMP), SqlDialect::Postgres);
        assert_eq!(detect_sql_dump_type("CREATE TABLE t (id int);"), SqlDialect::Unknown);
    }

    #[test]
    fn detection_is_case_insensitive_and_mysql_wins_on_a_line() {
        assert_eq!(detect_sql_dump_type("create table t (id serial primary key);"), SqlDialect::Postgres);
        assert_eq!(detect_sql_dump_type("x engine=innodb returning"), SqlDialect::MySql);
    }

    #[test]
    fn first_matching_line_decides() {
        let text = "INSERT INTO t VALUES (now());\nCREATE TABLE x (id int) ENGINE=InnoDB;";
        assert_eq!(detect_sql_dump_type(text), SqlDialect::Postgres);
    }

    #[test]
    fn splits_mysql_dump_respecting_quotes() {
        let statements = split_statements(MYSQL_DUMP);
        assert_eq!(statements[0], DumpStatement::Sql("/*!40101 SET NAMES utf8 */".into()));
        let commands: Vec<&str> = statements.iter().map(DumpStatement::command).collect();
        assert!(commands.iter().all(|s| !s.to_uppercase().starts_with("CREATE DATABASE")));
        assert!(commands.iter().all(|s| !s.to_uppercase().starts_with("USE ")));
        assert!(commands.iter().any(|s| s.ends_with("(1,'a;b'),(2,'it''s')")));
        assert_eq!(statements.len(), 6);
    }

    #[test]
    fn skips_meta_commands_and_keeps_copy_rows() {
        let statements = split_statements(PG_DUMP);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].command().starts_with("SET search_path"));
        assert!(statements[1].command().starts_with("CREATE TABLE customers"));
        assert_eq!(
            statements[2],
            DumpStatement::CopyFromStdin {
                command: "COPY public.customers (id, name) FROM stdin".into(),
                data: "1\tAda; Lovelace\n".into(),
            }
        );
        assert!(statements[3].command().starts_with("INSERT INTO customers"));
    }

    #[test]
    fn copy_blocks_keep_every_row_and_escape() {
        let script = "COPY orders (id, note) FROM stdin;\n\
            1\tfirst\n\
            2\t\\N\n\
            3\ttab\\there\n\
            \\.\n\
            SELECT 1;\n";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        match &statements[0] {
            DumpStatement::CopyFromStdin { command, data } => {
                assert_eq!(command, "COPY orders (id, note) FROM stdin");
                assert_eq!(data.lines().count(), 3);
                assert_eq!(data, "1\tfirst\n2\t\\N\n3\ttab\\there\n");
            }
            other => panic!("expected a COPY block, got {other:?}"),
        }
        assert_eq!(statements[1], DumpStatement::Sql("SELECT 1".into()));
    }

    #[test]
    fn comment_only_statements_are_dropped() {
        assert!(split_statements("-- nothing here\n/* nor here */;\n ; ").is_empty());
        assert_eq!(split_statements("SELECT 1"), vec![DumpStatement::Sql("SELECT 1".into())]);
    }

    #[test]
    fn database_names_are_per_file_and_safe() {
        let a = dump_database_name("6F1c-22aa");
        assert_eq!(a, "dump_6f1c22aa");
        assert!(is_safe_identifier(&a));
        assert_ne!(a, dump_database_name("6f1c-22ab"));
        assert!(!is_safe_identifier("shop; DROP"));
    }

    #[tokio::test]
    async fn detects_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        tokio::fs::write(&path, PG_DUMP).await.unwrap();
        assert_eq!(detect_sql_dump_file(&path).await.unwrap(), SqlDialect::Postgres);
    }
}
