//! Rendering surface that report scripts write to.
//!
//! Scripts only ever see a [`ReportPage`]; its method set is fixed and has no
//! page configuration. The page configuration belongs to the host through
//! [`HostPage`] and is set once per render cycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};

use crate::table::{Table, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Success => "success",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub kind: ChartKind,
    pub title: Option<String>,
    pub labels: Vec<String>,
    pub series: Vec<Series>,
}

impl Chart {
    /// One series per `y` column, labelled by the `x` column.
    /// Non-numeric cells become gaps.
    pub fn from_table(
        kind: ChartKind,
        table: &Table,
        x: &str,
        ys: &[String],
        title: Option<String>,
    ) -> Result<Self, TableError> {
        let labels = table
            .column(x)?
            .iter()
            .map(crate::table::cell_text)
            .collect();
        let series = ys
            .iter()
            .map(|y| {
                Ok(Series {
                    name: y.clone(),
                    values: table.column(y)?.iter().map(numeric).collect(),
                })
            })
            .collect::<Result<Vec<_>, TableError>>()?;
        Ok(Self {
            kind,
            title,
            labels,
            series,
        })
    }
}

fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

/// One element of the rendered report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Title { text: String },
    Header { text: String },
    Subheader { text: String },
    Markdown { source: String },
    Text { text: String },
    Caption { text: String },
    Code { source: String, language: Option<String> },
    Metric { label: String, value: String, delta: Option<String> },
    Table { table: Table },
    Json { value: Value },
    Chart { chart: Chart },
    Alert { level: AlertLevel, text: String },
    Divider,
}

/// Rendering capability handed to report scripts
pub trait ReportPage: Send + Sync {
    fn push(&self, block: Block);

    fn title(&self, text: &str) {
        self.push(Block::Title { text: text.to_string() });
    }

    fn header(&self, text: &str) {
        self.push(Block::Header { text: text.to_string() });
    }

    fn subheader(&self, text: &str) {
        self.push(Block::Subheader { text: text.to_string() });
    }

    fn markdown(&self, source: &str) {
        self.push(Block::Markdown { source: source.to_string() });
    }

    fn text(&self, text: &str) {
        self.push(Block::Text { text: text.to_string() });
    }

    fn caption(&self, text: &str) {
        self.push(Block::Caption { text: text.to_string() });
    }

    fn code(&self, source: &str, language: Option<&str>) {
        self.push(Block::Code {
            source: source.to_string(),
            language: language.map(str::to_string),
        });
    }

    fn metric(&self, label: &str, value: &str, delta: Option<&str>) {
        self.push(Block::Metric {
            label: label.to_string(),
            value: value.to_string(),
            delta: delta.map(str::to_string),
        });
    }

    fn table(&self, table: Table) {
        self.push(Block::Table { table });
    }

    fn json(&self, value: Value) {
        self.push(Block::Json { value });
    }

    fn chart(&self, chart: Chart) {
        self.push(Block::Chart { chart });
    }

    fn alert(&self, level: AlertLevel, text: &str) {
        self.push(Block::Alert {
            level,
            text: text.to_string(),
        });
    }

    fn divider(&self) {
        self.push(Block::Divider);
    }
}

/// Shared, append-only block list
#[derive(Debug, Clone, Default)]
pub struct PageSurface {
    blocks: Arc<Mutex<Vec<Block>>>,
}

impl PageSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.blocks.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportPage for PageSurface {
    fn push(&self, block: Block) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.push(block);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Wide,
    Centered,
}

/// Browser-level page settings, owned by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageConfig {
    pub title: String,
    pub layout: Layout,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            title: "Report".to_string(),
            layout: Layout::Wide,
        }
    }
}

/// Host side of one render: the page configuration plus the script surface
#[derive(Debug, Default)]
pub struct HostPage {
    config: OnceLock<PageConfig>,
    surface: PageSurface,
}

impl HostPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page configuration; only the first call per render has effect.
    pub fn configure(&self, config: PageConfig) -> bool {
        self.config.set(config).is_ok()
    }

    pub fn config(&self) -> PageConfig {
        self.config.get().cloned().unwrap_or_default()
    }

    /// Handle given to the execution context
    pub fn surface(&self) -> PageSurface {
        self.surface.clone()
    }

    pub fn finish(self) -> PageOutput {
        PageOutput {
            config: self.config.get().cloned().unwrap_or_default(),
            blocks: self.surface.blocks(),
        }
    }
}

/// Everything a render produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutput {
    pub config: PageConfig,
    pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_surface_appends_in_order() {
        let host = HostPage::new();
        let page = host.surface();
        page.title("Casos");
        page.metric("Total", "42", Some("+3"));
        page.divider();

        let output = host.finish();
        assert_eq!(output.blocks.len(), 3);
        assert_eq!(output.blocks[0], Block::Title { text: "Casos".to_string() });
        assert_eq!(output.blocks[2], Block::Divider);
    }

    #[test]
    fn test_page_config_is_set_once() {
        let host = HostPage::new();
        assert_eq!(host.config(), PageConfig::default());
        assert!(host.configure(PageConfig {
            title: "Saúde DF".to_string(),
            layout: Layout::Wide,
        }));
        assert!(!host.configure(PageConfig {
            title: "Hijacked".to_string(),
            layout: Layout::Centered,
        }));
        assert_eq!(host.config().title, "Saúde DF");
    }

    #[test]
    fn test_chart_from_table() {
        let table = Table::from_records(&[
            json!({ "month": "Jan", "cases": 10, "deaths": "2" }),
            json!({ "month": "Feb", "cases": null, "deaths": "n/a" }),
        ])
        .unwrap();
        let chart = Chart::from_table(
            ChartKind::Line,
            &table,
            "month",
            &["cases".to_string(), "deaths".to_string()],
            None,
        )
        .unwrap();
        assert_eq!(chart.labels, vec!["Jan", "Feb"]);
        assert_eq!(chart.series[0].values, vec![Some(10.0), None]);
        assert_eq!(chart.series[1].values, vec![Some(2.0), None]);

        assert!(Chart::from_table(ChartKind::Bar, &table, "nope", &[], None).is_err());
    }

    #[test]
    fn test_blocks_serialize_tagged() {
        let block = Block::Alert {
            level: AlertLevel::Warning,
            text: "careful".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({ "type": "alert", "level": "warning", "text": "careful" })
        );
    }
}
