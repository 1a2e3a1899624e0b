//! HTML pages of the portal: listing, report and developer sandbox.

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::config::PortalConfig;
use crate::conversion::format_date;
use crate::error::PortalError;
use crate::metadata::ReportCatalog;
use crate::model::ReportRecord;
use crate::page::Layout;
use crate::report_config::ReportConfig;

/// Stylesheet served at `/static/portal.css`
pub const PORTAL_CSS: &str = include_str!("../static/portal.css");

const TEMPLATES: &[(&str, &str)] = &[
    ("layout", include_str!("../templates/layout.hbs")),
    ("listing", include_str!("../templates/listing.hbs")),
    ("report", include_str!("../templates/report.hbs")),
    ("sandbox", include_str!("../templates/sandbox.hbs")),
];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template error: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),

    #[error("render error: {0}")]
    Render(#[from] handlebars::RenderError),
}

#[derive(Debug, Clone, Serialize)]
pub struct NavLink {
    pub id: String,
    pub title: String,
    pub href: String,
    pub active: bool,
}

/// Page-level notice shown above the content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Banner {
    pub level: &'static str,
    pub text: String,
}

impl Banner {
    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: "warning",
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: "error",
            text: text.into(),
        }
    }
}

/// Failure shown inside a report's render area
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPanel {
    pub headline: String,
    pub detail: String,
    pub kind: Option<String>,
    pub trace: Option<String>,
}

impl ErrorPanel {
    /// `debug` controls whether the script trace is included.
    pub fn from_error(err: &PortalError, debug: bool) -> Self {
        let (kind, detail) = match err {
            PortalError::Execution(exec) => (Some(exec.name.clone()), exec.message.clone()),
            other => (None, other.to_string()),
        };
        Self {
            headline: err.headline().to_string(),
            detail,
            kind,
            trace: if debug {
                err.trace().map(str::to_string)
            } else {
                None
            },
        }
    }
}

/// A rendered (or failed) report, ready for the page template
#[derive(Debug, Clone, Default)]
pub struct ReportView {
    /// Record as displayed, presentation overrides applied
    pub record: Option<ReportRecord>,
    pub report_id: String,
    pub content: String,
    pub error: Option<ErrorPanel>,
    pub warnings: Vec<String>,
    pub presentation: ReportConfig,
    pub layout: Layout,
}

pub struct Renderer {
    registry: Handlebars<'static>,
    portal: PortalConfig,
}

impl Renderer {
    pub fn new(portal: PortalConfig) -> Result<Self, RenderError> {
        let mut registry = Handlebars::new();
        // Every interpolation sits in element text or a double-quoted attribute.
        registry.register_escape_fn(|s| html_escape::encode_double_quoted_attribute(s).into_owned());
        for (name, source) in TEMPLATES {
            registry
                .register_template_string(name, *source)
                .map_err(Box::new)?;
        }
        Ok(Self { registry, portal })
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    /// Relative link that opens a report
    pub fn report_href(report_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(report_id.as_bytes()).collect();
        format!("/?id={}", encoded)
    }

    /// Absolute link when a public base URL is configured
    pub fn share_url(&self, report_id: &str) -> String {
        let href = Self::report_href(report_id);
        match &self.portal.public_base_url {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), href),
            None => href,
        }
    }

    fn nav(catalog: &ReportCatalog, active: Option<&str>) -> Vec<NavLink> {
        catalog
            .active()
            .into_iter()
            .map(|r| NavLink {
                id: r.report_id.clone(),
                title: r.title.clone(),
                href: Self::report_href(&r.report_id),
                active: Some(r.report_id.as_str()) == active,
            })
            .collect()
    }

    fn wrap(
        &self,
        page_title: &str,
        body: String,
        nav: Vec<NavLink>,
        banners: &[Banner],
        stylesheet: String,
        layout: Layout,
    ) -> Result<String, RenderError> {
        let data = json!({
            "portal_title": self.portal.title,
            "page_title": page_title,
            "logo_url": self.portal.logo_url,
            "logo_target": self.portal.logo_target,
            "dev_sandbox": self.portal.dev_sandbox,
            "nav": nav,
            "banners": banners,
            "stylesheet": stylesheet,
            "layout": layout,
            "body": body,
        });
        Ok(self.registry.render("layout", &data)?)
    }

    /// Homepage: every active report with a selection control
    pub fn listing(&self, catalog: &ReportCatalog, banners: &[Banner]) -> Result<String, RenderError> {
        let reports: Vec<_> = catalog
            .active()
            .into_iter()
            .map(|r| {
                json!({
                    "report_id": r.report_id,
                    "title": r.title,
                    "description": r.description,
                    "author": r.author,
                    "updated": format_date(&r.updated_at),
                    "href": Self::report_href(&r.report_id),
                })
            })
            .collect();
        let body = self.registry.render(
            "listing",
            &json!({
                "portal_title": self.portal.title,
                "count": reports.len(),
                "reports": reports,
            }),
        )?;
        self.wrap(
            &self.portal.title,
            body,
            Self::nav(catalog, None),
            banners,
            String::new(),
            Layout::Wide,
        )
    }

    pub fn report(
        &self,
        catalog: &ReportCatalog,
        view: &ReportView,
        banners: &[Banner],
    ) -> Result<String, RenderError> {
        let presentation = &view.presentation;
        let title = view
            .record
            .as_ref()
            .map(|r| r.title.clone())
            .unwrap_or_else(|| "Report not found".to_string());
        let body = self.registry.render(
            "report",
            &json!({
                "record": view.record,
                // Without a record there is nothing to put in the header.
                "show_header": view.record.is_some() && presentation.header_enabled(),
                "show_footer": view.record.is_some() && presentation.footer_enabled(),
                "created": view.record.as_ref().map(|r| format_date(&r.created_at)),
                "updated": view.record.as_ref().map(|r| format_date(&r.updated_at)),
                "share_url": self.share_url(&view.report_id),
                "warnings": view.warnings,
                "error": view.error,
                "content": view.content,
            }),
        )?;
        self.wrap(
            &title,
            body,
            Self::nav(catalog, Some(&view.report_id)),
            banners,
            presentation.stylesheet(),
            view.layout,
        )
    }

    /// Developer sandbox; `output` is the rendered result of a run, if any.
    pub fn sandbox(
        &self,
        catalog: &ReportCatalog,
        code: &str,
        output: Option<(&str, Option<&ErrorPanel>)>,
    ) -> Result<String, RenderError> {
        let (content, error) = output.unwrap_or(("", None));
        let body = self.registry.render(
            "sandbox",
            &json!({
                "code": code,
                "ran": output.is_some(),
                "content": content,
                "error": error,
            }),
        )?;
        self.wrap(
            "Developer sandbox",
            body,
            Self::nav(catalog, None),
            &[],
            String::new(),
            Layout::Wide,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutionError, ExecutionErrorKind};
    use serde_json::json;

    fn catalog() -> ReportCatalog {
        ReportCatalog::from_records(
            [
                json!({ "report_id": "r1", "titulo": "A <b>", "deletado": false, "updated_at": "2025-02-01T00:00:00Z" }),
                json!({ "report_id": "r2", "titulo": "B", "deletado": true }),
                json!({ "report_id": "saúde df", "titulo": "C" }),
            ]
            .iter()
            .map(|item| ReportRecord::from_item(item).unwrap()),
        )
    }

    fn renderer() -> Renderer {
        Renderer::new(PortalConfig::default()).expect("templates compile")
    }

    #[test]
    fn test_listing_shows_only_active_reports() {
        let html = renderer().listing(&catalog(), &[]).unwrap();
        assert!(html.contains("A &lt;b&gt;"));
        assert!(!html.contains("<b>"));
        assert!(!html.contains("?id=r2"));
        assert!(html.contains("href=\"/?id=r1\""));
        assert!(html.contains("01/02/2025"));
        assert!(html.contains("<select id=\"report-id\" name=\"id\">"));
    }

    #[test]
    fn test_listing_banner_and_empty_state() {
        let html = renderer()
            .listing(
                &ReportCatalog::default(),
                &[Banner::error("The report catalog is currently unavailable")],
            )
            .unwrap();
        assert!(html.contains("alert-error"));
        assert!(html.contains("No reports are available right now."));
    }

    #[test]
    fn test_report_href_is_encoded() {
        assert_eq!(Renderer::report_href("saúde df"), "/?id=sa%C3%BAde+df");
        let portal = PortalConfig {
            public_base_url: Some("https://reports.example.org/".to_string()),
            ..PortalConfig::default()
        };
        let renderer = Renderer::new(portal).unwrap();
        assert_eq!(renderer.share_url("r1"), "https://reports.example.org/?id=r1");
    }

    #[test]
    fn test_report_error_is_scoped_to_render_area() {
        let catalog = catalog();
        let record = catalog.resolve("r1").unwrap().clone();
        let err = PortalError::from(
            ExecutionError::new(ExecutionErrorKind::Script, "TypeError", "x is undefined")
                .with_trace(Some("at main.js:3".to_string())),
        );
        let view = ReportView {
            record: Some(record),
            report_id: "r1".to_string(),
            error: Some(ErrorPanel::from_error(&err, false)),
            ..ReportView::default()
        };
        let html = renderer().report(&catalog, &view, &[]).unwrap();
        assert!(html.contains("The report failed while running"));
        assert!(html.contains("TypeError"));
        assert!(!html.contains("at main.js:3"));
        // the sidebar still lists the other reports
        assert!(html.contains("class=\"active\""));
        assert!(html.contains("?id=sa%C3%BAde+df"));

        let debug_view = ReportView {
            error: Some(ErrorPanel::from_error(&err, true)),
            ..view
        };
        let html = renderer().report(&catalog, &debug_view, &[]).unwrap();
        assert!(html.contains("at main.js:3"));
    }

    #[test]
    fn test_report_header_footer_toggles() {
        let catalog = catalog();
        let record = catalog.resolve("r1").unwrap().clone();
        let presentation =
            ReportConfig::parse("[report]\nenable_header = false\n[theme]\nprimaryColor = \"#123456\"\n")
                .unwrap();
        let view = ReportView {
            record: Some(record),
            report_id: "r1".to_string(),
            content: "<p class=\"block-text\">hi</p>".to_string(),
            presentation,
            ..ReportView::default()
        };
        let html = renderer().report(&catalog, &view, &[]).unwrap();
        assert!(!html.contains("report-header"));
        assert!(html.contains("report-footer"));
        assert!(html.contains("--primary-color: #123456;"));
        assert!(html.contains("<p class=\"block-text\">hi</p>"));
    }

    #[test]
    fn test_sandbox_page() {
        let html = renderer()
            .sandbox(&catalog(), "page.title('</textarea>')", None)
            .unwrap();
        assert!(html.contains("action=\"/dev/run\""));
        assert!(html.contains("&lt;/textarea&gt;"));
        assert!(!html.contains("sandbox-output"));
    }
}
