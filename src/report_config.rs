//! Per-report presentation file (`config.toml` next to the script).

use serde::Deserialize;

use crate::model::ReportRecord;

/// `[theme]` section, keys as published with the reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThemeConfig {
    pub primary_color: Option<String>,
    pub background_color: Option<String>,
    pub secondary_background_color: Option<String>,
    pub text_color: Option<String>,
    pub font: Option<String>,
}

/// `[report]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    pub title: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub enable_header: Option<bool>,
    pub enable_footer: Option<bool>,
    pub custom_css: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub theme: ThemeConfig,
    pub report: ReportSection,
}

impl ReportConfig {
    /// Parse a presentation file; unknown sections and keys are ignored.
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn header_enabled(&self) -> bool {
        self.report.enable_header.unwrap_or(true)
    }

    pub fn footer_enabled(&self) -> bool {
        self.report.enable_footer.unwrap_or(true)
    }

    /// Record as displayed: `[report]` values override the catalog entry.
    pub fn overlay(&self, record: &ReportRecord) -> ReportRecord {
        let pick = |value: &Option<String>, fallback: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(fallback)
                .to_string()
        };
        ReportRecord {
            title: pick(&self.report.title, &record.title),
            description: pick(&self.report.description, &record.description),
            author: pick(&self.report.author, &record.author),
            created_at: pick(&self.report.created_at, &record.created_at),
            updated_at: pick(&self.report.updated_at, &record.updated_at),
            ..record.clone()
        }
    }

    /// CSS custom properties for the theme; values that could break out of
    /// a declaration are dropped.
    pub fn css_variables(&self) -> Vec<(&'static str, String)> {
        let theme = &self.theme;
        [
            ("--primary-color", &theme.primary_color),
            ("--background-color", &theme.background_color),
            ("--secondary-background-color", &theme.secondary_background_color),
            ("--text-color", &theme.text_color),
            ("--font-family", &theme.font),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value.as_deref()?.trim();
            safe_css_value(value).then(|| (name, value.to_string()))
        })
        .collect()
    }

    /// Inline stylesheet for the report area, empty when nothing is themed.
    pub fn stylesheet(&self) -> String {
        let mut css = String::new();
        let vars = self.css_variables();
        if !vars.is_empty() {
            css.push_str(".report-area {");
            for (name, value) in vars {
                css.push_str(&format!(" {}: {};", name, value));
            }
            css.push_str(" }\n");
        }
        if let Some(custom) = self.report.custom_css.as_deref() {
            // Keep the block inside its <style> element.
            css.push_str(&custom.replace("</", "<\\/"));
        }
        css
    }
}

fn safe_css_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && !value
            .chars()
            .any(|c| matches!(c, ';' | '{' | '}' | '<' | '>' | '\\') || c.is_control())
}
