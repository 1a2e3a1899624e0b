//! Host capabilities injected into report scripts.
//!
//! Each capability is a plain Rust object dispatching named operations over
//! JSON arguments. The script engine only forwards calls; nothing here knows
//! about JavaScript.

use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::PortalError;
use crate::fetcher::ScriptFetcher;
use crate::model::ReportRecord;
use crate::page::{AlertLevel, Chart, ChartKind, PageSurface, ReportPage};
use crate::staging::StagingSession;
use crate::table::{Table, TableError, cell_text};

/// Log target for script console output
pub const SCRIPT_LOG_TARGET: &str = "report_script";

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("unknown operation {capability}.{operation}")]
    UnknownOperation {
        capability: &'static str,
        operation: String,
    },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Portal(#[from] PortalError),
}

impl CapabilityError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type CapabilityResult = Result<Value, CapabilityError>;

/// A named group of operations reachable from scripts
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Operation names in the order the script sees them
    fn operations(&self) -> &'static [&'static str];

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult;

    fn unknown(&self, operation: &str) -> CapabilityError {
        CapabilityError::UnknownOperation {
            capability: self.name(),
            operation: operation.to_string(),
        }
    }
}

/// Everything the host hands to a single render
pub struct HostCapabilities {
    pub record: ReportRecord,
    pub fetcher: ScriptFetcher,
    pub session: Arc<StagingSession>,
    pub page: PageSurface,
}

/// The globals a script runs against
#[derive(Clone)]
pub struct ExecutionNamespace {
    pub page: PageCapability,
    pub table: TableCapability,
    pub storage: StorageCapability,
    pub paths: PathCapability,
    pub console: ConsoleCapability,
    /// Read-only metadata exposed as `REPORT`
    pub report: Value,
}

impl ExecutionNamespace {
    pub fn capabilities(&self) -> [&dyn Capability; 5] {
        [
            &self.page,
            &self.table,
            &self.storage,
            &self.paths,
            &self.console,
        ]
    }

    pub fn get(&self, name: &str) -> Option<&dyn Capability> {
        self.capabilities().into_iter().find(|c| c.name() == name)
    }
}

/// Assemble the namespace for one render.
pub fn build_context(host: HostCapabilities) -> ExecutionNamespace {
    let report = json!({
        "id": host.record.report_id,
        "title": host.record.title,
        "description": host.record.description,
        "author": host.record.author,
        "storagePath": host.record.storage_path,
        "bucket": host.fetcher.store().bucket(),
    });
    let record = Arc::new(host.record);
    ExecutionNamespace {
        page: PageCapability {
            page: Arc::new(host.page),
        },
        table: TableCapability,
        storage: StorageCapability {
            fetcher: host.fetcher,
            record: record.clone(),
        },
        paths: PathCapability {
            record: record.clone(),
            session: host.session,
        },
        console: ConsoleCapability {
            report_id: record.report_id.clone(),
        },
        report,
    }
}

fn arg<'a>(args: &'a [Value], index: usize) -> &'a Value {
    args.get(index).unwrap_or(&Value::Null)
}

fn arg_string(args: &[Value], index: usize, what: &str) -> Result<String, CapabilityError> {
    match arg(args, index) {
        Value::Null => Err(CapabilityError::invalid(format!("{} is required", what))),
        Value::Array(_) | Value::Object(_) => {
            Err(CapabilityError::invalid(format!("{} must be a string", what)))
        }
        other => Ok(cell_text(other)),
    }
}

fn opt_string(args: &[Value], index: usize) -> Option<String> {
    match arg(args, index) {
        Value::Null => None,
        other => Some(cell_text(other)),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => cell_text(other),
    }
}

/// Accepts a table value (`{columns, rows}`) or an array of records
fn arg_table(args: &[Value], index: usize) -> Result<Table, CapabilityError> {
    as_table(arg(args, index))
        .ok_or_else(|| CapabilityError::invalid("expected a table or an array of records"))?
}

fn as_table(value: &Value) -> Option<Result<Table, CapabilityError>> {
    match value {
        Value::Object(obj) if obj.contains_key("columns") && obj.contains_key("rows") => Some(
            serde_json::from_value(value.clone())
                .map_err(|e| CapabilityError::invalid(format!("malformed table: {}", e))),
        ),
        Value::Array(items) if items.iter().all(Value::is_object) => {
            Some(Table::from_records(items).map_err(CapabilityError::from))
        }
        _ => None,
    }
}

fn table_value(table: Table) -> CapabilityResult {
    serde_json::to_value(table).map_err(|e| CapabilityError::invalid(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct ChartOptions {
    x: Option<String>,
    y: Option<OneOrMany>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// `page`: appends blocks to the report output
#[derive(Clone)]
pub struct PageCapability {
    page: Arc<dyn ReportPage>,
}

impl PageCapability {
    fn chart(&self, kind: ChartKind, args: &[Value]) -> CapabilityResult {
        let table = arg_table(args, 0)?;
        let options: ChartOptions = match arg(args, 1) {
            Value::Null => ChartOptions::default(),
            v => serde_json::from_value(v.clone())
                .map_err(|e| CapabilityError::invalid(format!("chart options: {}", e)))?,
        };
        let x = match options.x {
            Some(x) => x,
            None => table
                .columns
                .first()
                .cloned()
                .ok_or_else(|| CapabilityError::invalid("chart data has no columns"))?,
        };
        let ys = match options.y {
            Some(OneOrMany::One(y)) => vec![y],
            Some(OneOrMany::Many(ys)) => ys,
            None => table.columns.iter().filter(|c| **c != x).cloned().collect(),
        };
        let chart = Chart::from_table(kind, &table, &x, &ys, options.title)?;
        self.page.chart(chart);
        Ok(Value::Null)
    }

    fn alert(&self, level: AlertLevel, args: &[Value]) -> CapabilityResult {
        self.page.alert(level, &text_of(arg(args, 0)));
        Ok(Value::Null)
    }
}

impl Capability for PageCapability {
    fn name(&self) -> &'static str {
        "page"
    }

    fn operations(&self) -> &'static [&'static str] {
        &[
            "title", "header", "subheader", "markdown", "text", "write", "caption", "code",
            "metric", "table", "json", "barChart", "lineChart", "info", "success", "warning",
            "error", "divider",
        ]
    }

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult {
        let page = &self.page;
        match operation {
            "title" => page.title(&text_of(arg(args, 0))),
            "header" => page.header(&text_of(arg(args, 0))),
            "subheader" => page.subheader(&text_of(arg(args, 0))),
            "markdown" => page.markdown(&text_of(arg(args, 0))),
            "text" => page.text(&text_of(arg(args, 0))),
            "caption" => page.caption(&text_of(arg(args, 0))),
            "code" => page.code(&text_of(arg(args, 0)), opt_string(args, 1).as_deref()),
            "metric" => page.metric(
                &arg_string(args, 0, "metric label")?,
                &text_of(arg(args, 1)),
                opt_string(args, 2).as_deref(),
            ),
            "table" => page.table(arg_table(args, 0)?),
            "json" => page.json(arg(args, 0).clone()),
            "write" => {
                for value in args {
                    match value {
                        Value::String(s) => page.markdown(s),
                        other => match as_table(other) {
                            Some(table) => page.table(table?),
                            None => page.json(other.clone()),
                        },
                    }
                }
            }
            "barChart" => return self.chart(ChartKind::Bar, args),
            "lineChart" => return self.chart(ChartKind::Line, args),
            "info" => return self.alert(AlertLevel::Info, args),
            "success" => return self.alert(AlertLevel::Success, args),
            "warning" => return self.alert(AlertLevel::Warning, args),
            "error" => return self.alert(AlertLevel::Error, args),
            "divider" => page.divider(),
            other => return Err(self.unknown(other)),
        }
        Ok(Value::Null)
    }
}

/// `table`: pure helpers over `{columns, rows}` values
#[derive(Clone, Copy, Default)]
pub struct TableCapability;

impl Capability for TableCapability {
    fn name(&self) -> &'static str {
        "table"
    }

    fn operations(&self) -> &'static [&'static str] {
        &[
            "fromRecords", "fromColumns", "fromCsv", "select", "sortBy", "head", "column",
        ]
    }

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult {
        match operation {
            "fromRecords" => {
                let records = arg(args, 0)
                    .as_array()
                    .ok_or_else(|| CapabilityError::invalid("fromRecords expects an array"))?;
                table_value(Table::from_records(records)?)
            }
            "fromColumns" => {
                let columns = arg(args, 0)
                    .as_object()
                    .ok_or_else(|| CapabilityError::invalid("fromColumns expects an object"))?;
                table_value(Table::from_columns(columns)?)
            }
            "fromCsv" => {
                let text = arg_string(args, 0, "CSV text")?;
                let delimiter = opt_string(args, 1)
                    .and_then(|d| d.chars().next())
                    .unwrap_or(',');
                table_value(Table::from_csv(&text, delimiter)?)
            }
            "select" => {
                let table = arg_table(args, 0)?;
                let names: Vec<String> = match arg(args, 1) {
                    Value::Array(items) => items.iter().map(cell_text).collect(),
                    Value::Null => {
                        return Err(CapabilityError::invalid("select expects column names"));
                    }
                    other => vec![cell_text(other)],
                };
                table_value(table.select(&names)?)
            }
            "sortBy" => {
                let table = arg_table(args, 0)?;
                let column = arg_string(args, 1, "sort column")?;
                let descending = arg(args, 2).as_bool().unwrap_or(false);
                table_value(table.sort_by(&column, descending)?)
            }
            "head" => {
                let table = arg_table(args, 0)?;
                let n = arg(args, 1).as_u64().unwrap_or(5) as usize;
                table_value(table.head(n))
            }
            "column" => {
                let table = arg_table(args, 0)?;
                Ok(Value::Array(table.column(&arg_string(args, 1, "column name")?)?))
            }
            other => Err(self.unknown(other)),
        }
    }
}

/// `storage`: read access to the bucket. Relative names resolve inside the
/// report's folder; a leading `/` addresses the whole bucket.
#[derive(Clone)]
pub struct StorageCapability {
    fetcher: ScriptFetcher,
    record: Arc<ReportRecord>,
}

impl StorageCapability {
    pub fn resolve_key(&self, name: &str) -> String {
        match name.strip_prefix('/') {
            Some(absolute) => absolute.to_string(),
            None => self.record.object_key(name),
        }
    }

    fn read_text(&self, name: &str) -> Result<String, CapabilityError> {
        let key = self.resolve_key(name);
        let bytes = self.fetcher.download(&key)?;
        debug!(report_id = %self.record.report_id, key = %key, bytes = bytes.len(), "script read object");
        String::from_utf8(bytes)
            .map_err(|_| CapabilityError::invalid(format!("{} is not UTF-8 text", key)))
    }
}

impl Capability for StorageCapability {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn operations(&self) -> &'static [&'static str] {
        &["exists", "getText", "getJson", "bucket"]
    }

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult {
        match operation {
            "exists" => {
                let key = self.resolve_key(&arg_string(args, 0, "object name")?);
                Ok(Value::Bool(self.fetcher.exists(&key)?))
            }
            "getText" => Ok(Value::String(
                self.read_text(&arg_string(args, 0, "object name")?)?,
            )),
            "getJson" => {
                let name = arg_string(args, 0, "object name")?;
                let text = self.read_text(&name)?;
                serde_json::from_str(&text)
                    .map_err(|e| CapabilityError::invalid(format!("{} is not valid JSON: {}", name, e)))
            }
            "bucket" => Ok(Value::String(self.fetcher.store().bucket())),
            other => Err(self.unknown(other)),
        }
    }
}

/// `paths`: key helpers and the render's private temp files
#[derive(Clone)]
pub struct PathCapability {
    record: Arc<ReportRecord>,
    session: Arc<StagingSession>,
}

impl PathCapability {
    pub fn staged(&self) -> Vec<PathBuf> {
        self.session.staged_paths()
    }
}

impl Capability for PathCapability {
    fn name(&self) -> &'static str {
        "paths"
    }

    fn operations(&self) -> &'static [&'static str] {
        &["join", "report", "tempDir", "writeTemp"]
    }

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult {
        match operation {
            "join" => {
                let joined = args
                    .iter()
                    .map(cell_text)
                    .map(|p| p.trim_matches('/').to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
                    .join("/");
                Ok(Value::String(joined))
            }
            "report" => Ok(Value::String(
                self.record.object_key(&opt_string(args, 0).unwrap_or_default()),
            )),
            "tempDir" => Ok(Value::String(self.session.dir().display().to_string())),
            "writeTemp" => {
                let name = arg_string(args, 0, "file name")?;
                let contents = text_of(arg(args, 1));
                let path = self.session.stage(&name, contents.as_bytes())?;
                Ok(Value::String(path.display().to_string()))
            }
            other => Err(self.unknown(other)),
        }
    }
}

/// `console`: forwards script output to the service log
#[derive(Clone)]
pub struct ConsoleCapability {
    report_id: String,
}

impl Capability for ConsoleCapability {
    fn name(&self) -> &'static str {
        "console"
    }

    fn operations(&self) -> &'static [&'static str] {
        &["log", "info", "warn", "error", "debug"]
    }

    fn call(&self, operation: &str, args: &[Value]) -> CapabilityResult {
        let message = args.iter().map(text_of).collect::<Vec<_>>().join(" ");
        let report_id = self.report_id.as_str();
        match operation {
            "log" | "info" => info!(target: SCRIPT_LOG_TARGET, report_id, "{}", message),
            "warn" => warn!(target: SCRIPT_LOG_TARGET, report_id, "{}", message),
            "error" => error!(target: SCRIPT_LOG_TARGET, report_id, "{}", message),
            "debug" => debug!(target: SCRIPT_LOG_TARGET, report_id, "{}", message),
            other => return Err(self.unknown(other)),
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::page::{Block, HostPage};
    use crate::staging::StagingArea;
    use crate::storage::{MemoryObjectStore, RetryPolicy};

    struct Fixture {
        host: HostPage,
        store: MemoryObjectStore,
        ns: ExecutionNamespace,
        session: Arc<StagingSession>,
    }

    fn fixture() -> Fixture {
        let store = MemoryObjectStore::new("reports");
        let fetcher = ScriptFetcher::new(Arc::new(store.clone()), &StorageConfig::default())
            .with_retry(RetryPolicy::single_attempt());
        let area = StagingArea::new(
            std::env::temp_dir().join(format!("reportportal-caps-{}", uuid::Uuid::new_v4())),
        );
        let session = Arc::new(area.session("r1"));
        let host = HostPage::new();
        let ns = build_context(HostCapabilities {
            record: ReportRecord::local("r1", "Casos"),
            fetcher,
            session: session.clone(),
            page: host.surface(),
        });
        Fixture {
            host,
            store,
            ns,
            session,
        }
    }

    #[test]
    fn test_report_metadata_exposed() {
        let f = fixture();
        assert_eq!(f.ns.report["id"], "r1");
        assert_eq!(f.ns.report["storagePath"], "r1/");
        assert_eq!(f.ns.report["bucket"], "reports");
    }

    #[test]
    fn test_page_operations_append_blocks() {
        let f = fixture();
        let page = f.ns.get("page").unwrap();
        page.call("title", &[json!("Casos")]).unwrap();
        page.call("metric", &[json!("Total"), json!(42)]).unwrap();
        page.call("write", &[json!("**bold**"), json!([{ "a": 1 }]), json!({ "k": true })])
            .unwrap();
        page.call("barChart", &[json!([{ "m": "Jan", "v": 3 }])]).unwrap();

        let blocks = f.host.finish().blocks;
        assert_eq!(blocks.len(), 6);
        assert!(matches!(&blocks[1], Block::Metric { value, .. } if value == "42"));
        assert!(matches!(&blocks[2], Block::Markdown { .. }));
        assert!(matches!(&blocks[3], Block::Table { .. }));
        assert!(matches!(&blocks[4], Block::Json { .. }));
        assert!(matches!(&blocks[5], Block::Chart { chart } if chart.series[0].name == "v"));
    }

    #[test]
    fn test_page_has_no_configuration_operation() {
        let f = fixture();
        let page = f.ns.get("page").unwrap();
        assert!(!page.operations().contains(&"setPageConfig"));
        assert!(matches!(
            page.call("setPageConfig", &[json!({ "title": "x" })]),
            Err(CapabilityError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_table_operations() {
        let f = fixture();
        let table = f.ns.get("table").unwrap();
        let t = table
            .call("fromCsv", &[json!("city,pop\nA,3\nB,9\n")])
            .unwrap();
        let sorted = table.call("sortBy", &[t.clone(), json!("pop"), json!(true)]).unwrap();
        let cities = table.call("column", &[sorted, json!("city")]).unwrap();
        assert_eq!(cities, json!(["B", "A"]));

        let err = table.call("select", &[t, json!(["nope"])]).unwrap_err();
        assert!(matches!(err, CapabilityError::Table(TableError::UnknownColumn(_))));
    }

    #[test]
    fn test_storage_reads_relative_and_absolute_keys() {
        let f = fixture();
        f.store.put("r1/data.json", r#"{"n": 7}"#);
        f.store.put("shared/regions.csv", "id\n1\n");
        let storage = f.ns.get("storage").unwrap();

        assert_eq!(storage.call("getJson", &[json!("data.json")]).unwrap(), json!({ "n": 7 }));
        assert_eq!(
            storage.call("getText", &[json!("/shared/regions.csv")]).unwrap(),
            json!("id\n1\n")
        );
        assert_eq!(storage.call("exists", &[json!("missing.csv")]).unwrap(), json!(false));
        assert!(matches!(
            storage.call("getText", &[json!("missing.csv")]),
            Err(CapabilityError::Portal(PortalError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_write_temp_is_tracked_by_session() {
        let f = fixture();
        let paths = f.ns.get("paths").unwrap();
        let written = paths.call("writeTemp", &[json!("out.csv"), json!("a,b")]).unwrap();
        let written = PathBuf::from(written.as_str().unwrap());
        assert!(written.exists());
        assert_eq!(f.session.staged_paths(), vec![written.clone()]);

        assert_eq!(paths.call("join", &[json!("a/"), json!("/b")]).unwrap(), json!("a/b"));
        assert_eq!(paths.call("report", &[json!("x.csv")]).unwrap(), json!("r1/x.csv"));

        f.session.finish();
        assert!(!written.exists());
        std::fs::remove_dir_all(f.session.dir()).ok();
    }
}
