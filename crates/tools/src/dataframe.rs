//! In-memory tables loaded from CSV or Excel files, and the dataframe tool that
//! answers natural-language questions over one of them.
//!
//! The model never runs code. It plans a [`FrameQuery`] (filters, grouping, one
//! aggregate, sort, limit) as JSON and the tool executes that plan.

use crate::env::{ToolEnv, strip_fence};
use async_trait::async_trait;
use calamine::{Data, Reader, open_workbook_auto};
use docchat_core::chat::ChatFile;
use docchat_core::error::ToolError;
use docchat_core::tool::{Tool, ToolResult, text_input, text_input_schema};
use serde::Deserialize;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_LIMIT: usize = 20;
const PREVIEW_ROWS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("{0} has no header row")]
    NoHeader(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column '{column}' is not numeric")]
    NotNumeric { column: String },

    #[error("invalid query plan: {0}")]
    InvalidPlan(String),
}

/// One table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Bool(bool),
    Text(String),
}

impl Cell {
    fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if s.is_empty() {
            Cell::Empty
        } else if let Ok(n) = s.parse::<f64>() {
            Cell::Number(n)
        } else {
            match s.to_ascii_lowercase().as_str() {
                "true" => Cell::Bool(true),
                "false" => Cell::Bool(false),
                _ => Cell::Text(s.to_string()),
            }
        }
    }

    fn from_sheet(cell: &Data) -> Self {
        match cell {
            Data::Empty => Cell::Empty,
            Data::String(s) => Cell::parse(s),
            Data::Int(i) => Cell::Number(*i as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::Bool(b) => Cell::Bool(*b),
            Data::DateTime(dt) => Cell::Text(dt.to_string()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Text(format!("#ERR:{e:?}")),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Cell::Empty,
            serde_json::Value::Bool(b) => Cell::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
            serde_json::Value::String(s) => Cell::parse(s),
            other => Cell::Text(other.to_string()),
        }
    }

    fn compare(&self, other: &Cell) -> Ordering {
        match (self, other) {
            (Cell::Number(a), Cell::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Cell::Empty, Cell::Empty) => Ordering::Equal,
            (Cell::Empty, _) => Ordering::Less,
            (_, Cell::Empty) => Ordering::Greater,
            (a, b) => a.to_string().to_lowercase().cmp(&b.to_string().to_lowercase()),
        }
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => write!(f, "{}", *n as i64),
            Cell::Number(n) => {
                let s = format!("{n:.4}");
                f.write_str(s.trim_end_matches('0').trim_end_matches('.'))
            }
            Cell::Bool(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// A rectangular table with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, Cell::Empty);
                r
            })
            .collect();
        Self { columns, rows }
    }

    /// Load a spreadsheet file: CSV by MIME type or extension, anything else through calamine.
    pub fn load(file: &ChatFile) -> Result<Self, FrameError> {
        let path = Path::new(&file.path_name);
        let is_csv = file.mime_type.to_ascii_lowercase().contains("csv")
            || path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if is_csv {
            Self::from_csv(path)
        } else {
            Self::from_workbook(path)
        }
    }

    pub fn from_csv(path: &Path) -> Result<Self, FrameError> {
        let read_err = |e: csv::Error| FrameError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(read_err)?;

        let columns: Vec<String> = reader.headers().map_err(read_err)?.iter().map(str::to_string).collect();
        if columns.is_empty() {
            return Err(FrameError::NoHeader(path.display().to_string()));
        }
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(read_err)?;
            rows.push(record.iter().map(Cell::parse).collect());
        }
        Ok(Self::new(columns, rows))
    }

    /// First worksheet of an Excel/ODS workbook; its first row is the header.
    pub fn from_workbook(path: &Path) -> Result<Self, FrameError> {
        let read_err = |reason: String| FrameError::Read {
            path: path.display().to_string(),
            reason,
        };
        let mut workbook = open_workbook_auto(path).map_err(|e| read_err(e.to_string()))?;
        let first = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| read_err("workbook has no sheets".into()))?;
        let range = workbook
            .worksheet_range(&first)
            .map_err(|e| read_err(e.to_string()))?;

        let mut rows = range.rows();
        let header = rows
            .next()
            .ok_or_else(|| FrameError::NoHeader(path.display().to_string()))?;
        let columns = header
            .iter()
            .enumerate()
            .map(|(i, c)| match Cell::from_sheet(c).to_string() {
                s if s.is_empty() => format!("column_{i}"),
                s => s,
            })
            .collect();
        let rows = rows
            .map(|r| r.iter().map(Cell::from_sheet).collect())
            .collect();
        Ok(Self::new(columns, rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Result<usize, FrameError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
            .ok_or_else(|| FrameError::UnknownColumn(name.to_string()))
    }

    /// Render as a markdown table, at most `max_rows` rows when given.
    pub fn to_markdown(&self, max_rows: Option<usize>) -> String {
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!("|{}\n", " --- |".repeat(self.columns.len())));
        let take = max_rows.unwrap_or(self.rows.len());
        for row in self.rows.iter().take(take) {
            let cells: Vec<String> = row
                .iter()
                .map(|c| c.to_string().replace('|', "\\|").replace('\n', " "))
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        out
    }

    /// Execute a query plan.
    pub fn run(&self, query: &FrameQuery) -> Result<Frame, FrameError> {
        let mut filters = Vec::with_capacity(query.filters.len());
        for f in &query.filters {
            filters.push((self.column_index(&f.column)?, f.op, Cell::from_json(&f.value)));
        }
        let rows: Vec<&Vec<Cell>> = self
            .rows
            .iter()
            .filter(|row| filters.iter().all(|(idx, op, value)| op.test(&row[*idx], value)))
            .collect();

        let mut result = match (&query.aggregate, &query.group_by) {
            (Some(agg), group_by) => self.aggregate(&rows, agg, group_by.as_deref())?,
            (None, Some(_)) => {
                return Err(FrameError::InvalidPlan("group_by requires an aggregate".into()));
            }
            (None, None) => {
                let indices = if query.select.is_empty() {
                    (0..self.columns.len()).collect::<Vec<_>>()
                } else {
                    query
                        .select
                        .iter()
                        .map(|c| self.column_index(c))
                        .collect::<Result<Vec<_>, _>>()?
                };
                Frame {
                    columns: indices.iter().map(|&i| self.columns[i].clone()).collect(),
                    rows: rows
                        .iter()
                        .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                        .collect(),
                }
            }
        };

        if let Some(sort) = &query.sort {
            let idx = result.column_index(&sort.column)?;
            result.rows.sort_by(|a, b| {
                let ord = a[idx].compare(&b[idx]);
                if sort.descending { ord.reverse() } else { ord }
            });
        }
        result.rows.truncate(query.limit.unwrap_or(DEFAULT_LIMIT));
        Ok(result)
    }

    fn aggregate(&self, rows: &[&Vec<Cell>], agg: &Aggregate, group_by: Option<&str>) -> Result<Frame, FrameError> {
        let value_idx = match &agg.column {
            Some(c) => Some(self.column_index(c)?),
            None if agg.op == AggOp::Count => None,
            None => return Err(FrameError::InvalidPlan(format!("{:?} needs a column", agg.op))),
        };
        let label = match &agg.column {
            Some(c) => format!("{}({c})", agg.op.as_str()),
            None => "count".to_string(),
        };

        let Some(group) = group_by else {
            let value = agg.apply(rows.iter().copied(), value_idx, &self.columns)?;
            return Ok(Frame::new(vec![label], vec![vec![value]]));
        };

        let group_idx = self.column_index(group)?;
        let mut keys: Vec<String> = Vec::new();
        let mut members: Vec<Vec<&Vec<Cell>>> = Vec::new();
        for &row in rows {
            let key = row[group_idx].to_string();
            match keys.iter().position(|k| *k == key) {
                Some(pos) => members[pos].push(row),
                None => {
                    keys.push(key);
                    members.push(vec![row]);
                }
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for (key, group_rows) in keys.into_iter().zip(members) {
            let value = agg.apply(group_rows.into_iter(), value_idx, &self.columns)?;
            out.push(vec![Cell::parse(&key), value]);
        }
        Ok(Frame::new(vec![self.columns[group_idx].clone(), label], out))
    }
}

/// A query plan produced by the model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameQuery {
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub aggregate: Option<Aggregate>,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==", alias = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = "contains")]
    Contains,
}

impl FilterOp {
    fn test(&self, cell: &Cell, value: &Cell) -> bool {
        match self {
            FilterOp::Contains => cell
                .to_string()
                .to_lowercase()
                .contains(&value.to_string().to_lowercase()),
            FilterOp::Eq => cell.compare(value) == Ordering::Equal,
            FilterOp::Ne => cell.compare(value) != Ordering::Equal,
            FilterOp::Gt => cell.compare(value) == Ordering::Greater,
            FilterOp::Ge => cell.compare(value) != Ordering::Less,
            FilterOp::Lt => cell.compare(value) == Ordering::Less,
            FilterOp::Le => cell.compare(value) != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Aggregate {
    pub op: AggOp,
    #[serde(default)]
    pub column: Option<String>,
}

impl Aggregate {
    fn apply<'a>(
        &self,
        rows: impl Iterator<Item = &'a Vec<Cell>>,
        column: Option<usize>,
        names: &[String],
    ) -> Result<Cell, FrameError> {
        let Some(idx) = column else {
            return Ok(Cell::Number(rows.count() as f64));
        };
        let cells: Vec<&Cell> = rows.map(|r| &r[idx]).filter(|c| **c != Cell::Empty).collect();
        if self.op == AggOp::Count {
            return Ok(Cell::Number(cells.len() as f64));
        }
        if matches!(self.op, AggOp::Min | AggOp::Max) {
            let pick = cells.into_iter().reduce(|a, b| {
                let keep_b = match self.op {
                    AggOp::Min => b.compare(a) == Ordering::Less,
                    _ => b.compare(a) == Ordering::Greater,
                };
                if keep_b { b } else { a }
            });
            return Ok(pick.cloned().unwrap_or(Cell::Empty));
        }

        let mut numbers = Vec::with_capacity(cells.len());
        for cell in cells {
            numbers.push(cell.as_number().ok_or_else(|| FrameError::NotNumeric {
                column: names[idx].clone(),
            })?);
        }
        let sum: f64 = numbers.iter().sum();
        Ok(match self.op {
            AggOp::Sum => Cell::Number(sum),
            _ if numbers.is_empty() => Cell::Empty,
            _ => Cell::Number(sum / numbers.len() as f64),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggOp {
    Count,
    Sum,
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Min,
    Max,
}

impl AggOp {
    fn as_str(&self) -> &'static str {
        match self {
            AggOp::Count => "count",
            AggOp::Sum => "sum",
            AggOp::Mean => "mean",
            AggOp::Min => "min",
            AggOp::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sort {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

const PLAN_PROMPT: &str = r#"You translate questions about a table into a JSON query plan.
The plan has these optional keys:
  "select": [column names] (omit for all columns),
  "filters": [{"column": name, "op": one of "==","!=",">",">=","<","<=","contains", "value": value}],
  "group_by": column name (only together with "aggregate"),
  "aggregate": {"op": one of "count","sum","mean","min","max", "column": name},
  "sort": {"column": name, "descending": bool},
  "limit": number of rows.
Column names must be copied exactly. Output only the JSON object."#;

/// Natural-language queries over one spreadsheet.
pub struct DataFrameTool {
    name: String,
    description: String,
    frame: Arc<Frame>,
    env: ToolEnv,
}

impl DataFrameTool {
    pub fn new(index: usize, file_name: &str, frame: Frame, env: ToolEnv) -> Self {
        Self {
            name: format!("pandas_tool_{index}"),
            description: format!("Tool for evaluating spreadsheet of file: {file_name}"),
            frame: Arc::new(frame),
            env,
        }
    }

    /// Load the file off the async runtime and bind a tool to it.
    pub async fn load(index: usize, file: &ChatFile, env: ToolEnv) -> Result<Self, ToolError> {
        let owned = file.clone();
        let frame = tokio::task::spawn_blocking(move || Frame::load(&owned))
            .await
            .map_err(|e| ToolError::ConstructionFailed {
                tool_name: format!("pandas_tool_{index}"),
                reason: e.to_string(),
            })?
            .map_err(|e| ToolError::ConstructionFailed {
                tool_name: format!("pandas_tool_{index}"),
                reason: e.to_string(),
            })?;
        debug!(file_id = %file.id, rows = frame.len(), "Spreadsheet loaded");
        Ok(Self::new(index, &file.file_name, frame, env))
    }

    async fn answer(&self, question: &str) -> Result<String, String> {
        let prompt = format!(
            "Columns: {}\nFirst rows:\n{}\nQuestion: {question}",
            self.frame.columns.join(", "),
            self.frame.to_markdown(Some(PREVIEW_ROWS))
        );
        let reply = self.env.ask(PLAN_PROMPT, &prompt).await.map_err(|e| e.to_string())?;
        let plan: FrameQuery = serde_json::from_str(strip_fence(&reply))
            .map_err(|e| FrameError::InvalidPlan(e.to_string()).to_string())?;
        let result = self.frame.run(&plan).map_err(|e| e.to_string())?;
        if result.is_empty() {
            return Ok("The query matched no rows.".into());
        }
        Ok(result.to_markdown(None))
    }
}

#[async_trait]
impl Tool for DataFrameTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        text_input_schema("A question about the spreadsheet's rows and columns")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let outcome = match text_input(&arguments) {
            Ok(question) => self.answer(&question).await,
            Err(e) => Err(e.to_string()),
        };
        Ok(match outcome {
            Ok(table) => ToolResult::ok(table),
            Err(e) => {
                warn!(tool = %self.name, error = %e, "Dataframe query failed");
                ToolResult::error(format!("Error: {e}"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedLlm;
    use docchat_memory::InMemoryVectorStore;

    fn sales() -> Frame {
        let rows = [
            ("north", "widget", "10", "2.5"),
            ("south", "widget", "4", "2.5"),
            ("north", "gadget", "7", "10"),
            ("east", "gadget", "", "10"),
        ];
        Frame::new(
            vec!["region".into(), "product".into(), "units".into(), "price".into()],
            rows.iter()
                .map(|(a, b, c, d)| vec![Cell::parse(a), Cell::parse(b), Cell::parse(c), Cell::parse(d)])
                .collect(),
        )
    }

    fn plan(json: &str) -> FrameQuery {
        serde_json::from_str(json).unwrap()
    }

    fn env(replies: Vec<&str>) -> ToolEnv {
        ToolEnv::new(
            Arc::new(ScriptedLlm::new(replies)),
            "mock",
            "embed",
            Arc::new(InMemoryVectorStore::new()),
        )
    }

    #[test]
    fn loads_csv_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        std::fs::write(&path, "name,age\nada, 36\nalan,41\n").unwrap();
        let frame = Frame::from_csv(&path).unwrap();
        assert_eq!(frame.columns, vec!["name", "age"]);
        assert_eq!(frame.rows[0][1], Cell::Number(36.0));
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn missing_workbook_is_read_error() {
        let err = Frame::from_workbook(Path::new("/nonexistent/book.xlsx")).unwrap_err();
        assert!(matches!(err, FrameError::Read { .. }));
    }

    #[test]
    fn filter_and_select() {
        let out = sales()
            .run(&plan(r#"{"select":["product"],"filters":[{"column":"region","op":"==","value":"north"}]}"#))
            .unwrap();
        assert_eq!(out.columns, vec!["product"]);
        assert_eq!(out.rows.len(), 2);
    }

    #[test]
    fn grouped_sum_keeps_first_seen_order() {
        let out = sales()
            .run(&plan(r#"{"group_by":"region","aggregate":{"op":"sum","column":"units"}}"#))
            .unwrap();
        assert_eq!(out.columns, vec!["region", "sum(units)"]);
        assert_eq!(out.rows[0], vec![Cell::Text("north".into()), Cell::Number(17.0)]);
        assert_eq!(out.rows[2], vec![Cell::Text("east".into()), Cell::Number(0.0)]);
    }

    #[test]
    fn mean_skips_empty_cells_and_count_counts_rows() {
        let frame = sales();
        let mean = frame.run(&plan(r#"{"aggregate":{"op":"avg","column":"units"}}"#)).unwrap();
        assert_eq!(mean.rows[0][0], Cell::Number(7.0));
        let count = frame.run(&plan(r#"{"aggregate":{"op":"count"}}"#)).unwrap();
        assert_eq!(count.rows[0][0], Cell::Number(4.0));
    }

    #[test]
    fn sort_descending_with_limit() {
        let out = sales()
            .run(&plan(r#"{"sort":{"column":"units","descending":true},"limit":1}"#))
            .unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0][2], Cell::Number(10.0));
    }

    #[test]
    fn unknown_column_and_non_numeric_fail() {
        let frame = sales();
        assert!(matches!(
            frame.run(&plan(r#"{"select":["nope"]}"#)),
            Err(FrameError::UnknownColumn(_))
        ));
        assert!(matches!(
            frame.run(&plan(r#"{"aggregate":{"op":"sum","column":"product"}}"#)),
            Err(FrameError::NotNumeric { .. })
        ));
    }

    #[test]
    fn markdown_rendering() {
        let md = sales().to_markdown(Some(1));
        assert!(md.starts_with("| region | product | units | price |\n| --- | --- | --- | --- |\n"));
        assert!(md.contains("| north | widget | 10 | 2.5 |"));
        assert_eq!(md.lines().count(), 3);
    }

    #[tokio::test]
    async fn tool_answers_through_a_plan() {
        let tool = DataFrameTool::new(
            0,
            "sales.csv",
            sales(),
            env(vec![r#"```json
{"filters":[{"column":"product","op":"contains","value":"gadg"}],"aggregate":{"op":"max","column":"units"}}
```"#]),
        );
        assert_eq!(tool.name(), "pandas_tool_0");
        assert_eq!(tool.description(), "Tool for evaluating spreadsheet of file: sales.csv");
        let result = tool.execute(serde_json::json!({"input": "max gadget units"})).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("| 7 |"));
    }

    #[tokio::test]
    async fn tool_failure_is_a_textual_observation() {
        let tool = DataFrameTool::new(1, "sales.csv", sales(), env(vec!["this is not json"]));
        let result = tool.execute(serde_json::json!({"input": "anything"})).await.unwrap();
        assert!(!result.success);
        assert!(result.output.starts_with("Error: "));
    }
}
