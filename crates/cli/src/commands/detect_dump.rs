//! `docchat detect-dump`: print the dialect of a SQL dump.

use std::path::Path;

use anyhow::Context;
use docchat_tools::sql::detect_sql_dump_file;

pub async fn run(file: &Path) -> anyhow::Result<()> {
    let dialect = detect_sql_dump_file(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{dialect}");
    Ok(())
}
