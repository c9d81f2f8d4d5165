//! Per-turn tools for DocChat.
//!
//! A chat's files are turned into tool bindings each turn: vector retrieval over
//! generic documents, dataframe queries over spreadsheets, SQL over relational
//! dumps, and the two web tools. Every binding is scoped to exactly one file.

pub mod dataframe;
pub mod env;
pub mod factory;
pub mod filters;
pub mod retrieval;
pub mod sql;
pub mod web;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use dataframe::{DataFrameTool, Frame, FrameQuery};
pub use env::ToolEnv;
pub use factory::{FileSelection, ToolFactory, WebTools};
pub use filters::{build_filters, file_filter};
pub use retrieval::{QueryMode, VectorRetrievalTool};
pub use sql::{
    DumpStatement, MemorySqlServers, SqlCatalog, SqlServers, SqlTool, SqlxServers, TableSchema, detect_sql_dump_file,
    detect_sql_dump_type, dump_database_name, split_statements,
};
pub use web::{DuckDuckGoSearcher, HttpWebFetcher, WebArtifactSink, WebScrapeTool, WebSearchTool, html_to_text};
