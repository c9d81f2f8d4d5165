//! Relational dumps: detection, isolated databases, and the SQL tool.

pub mod catalog;
pub mod dump;
pub mod memory;
pub mod tool;

pub use catalog::{QueryRows, SqlCatalog, SqlServers, SqlxServers, TableColumn, TableSchema, limited_statement};
pub use dump::{DumpStatement, detect_sql_dump_file, detect_sql_dump_type, dump_database_name, split_statements};
pub use memory::MemorySqlServers;
pub use tool::SqlTool;
