//! Conversion of rendered blocks to HTML fragments.
//!
//! Everything a script produced is escaped here; raw HTML inside markdown is
//! shown as text.

use chrono::{DateTime, NaiveDate};
use html_escape::{encode_double_quoted_attribute, encode_text};
use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, html};
use std::fmt::Write;

use crate::page::{Block, Chart, ChartKind};
use crate::table::{Table, cell_text};

/// Maximum size for markdown input (1MB)
const MAX_MARKDOWN_SIZE: usize = 1_000_000;

/// Rows shown for a table block before it is cut off
const MAX_TABLE_ROWS: usize = 1_000;

const PALETTE: &[&str] = &[
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#17becf",
];

/// Link schemes markdown may point at; anything else besides relative
/// references is dropped
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "mailto"];

/// Convert markdown to HTML with tables, footnotes, strikethrough and task
/// lists enabled. Inline and block HTML is escaped, and link or image
/// destinations with other schemes are replaced by `#`.
pub fn convert_markdown_to_html(markdown: &str) -> Result<String, String> {
    if markdown.len() > MAX_MARKDOWN_SIZE {
        return Err(format!(
            "Markdown input too large: {} bytes (max: {} bytes / 1MB)",
            markdown.len(),
            MAX_MARKDOWN_SIZE
        ));
    }

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Link {
            link_type,
            dest_url: safe_destination(dest_url),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) => Event::Start(Tag::Image {
            link_type,
            dest_url: safe_destination(dest_url),
            title,
            id,
        }),
        other => other,
    });
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);
    Ok(html_output)
}

fn safe_destination(url: CowStr<'_>) -> CowStr<'_> {
    // browsers ignore whitespace and control characters inside a scheme
    let cleaned: String = url
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_ascii_control())
        .collect();
    let scheme_end = cleaned.find([':', '/', '?', '#']);
    match scheme_end {
        Some(i) if cleaned[i..].starts_with(':') => {
            let scheme = cleaned[..i].to_ascii_lowercase();
            if ALLOWED_SCHEMES.contains(&scheme.as_str()) {
                url
            } else {
                CowStr::Borrowed("#")
            }
        }
        _ => url,
    }
}

/// Footer date: `dd/mm/YYYY` from RFC 3339 or `YYYY-MM-DD`, otherwise the
/// first ten characters as given.
pub fn format_date(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.format("%d/%m/%Y").to_string();
    }
    let head: String = raw.chars().take(10).collect();
    match NaiveDate::parse_from_str(&head, "%Y-%m-%d") {
        Ok(date) => date.format("%d/%m/%Y").to_string(),
        Err(_) => head,
    }
}

/// Render all blocks in order
pub fn blocks_to_html(blocks: &[Block]) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(&block_to_html(block));
        out.push('\n');
    }
    out
}

pub fn block_to_html(block: &Block) -> String {
    match block {
        Block::Title { text } => format!("<h1 class=\"block-title\">{}</h1>", encode_text(text)),
        Block::Header { text } => format!("<h2 class=\"block-header\">{}</h2>", encode_text(text)),
        Block::Subheader { text } => {
            format!("<h3 class=\"block-subheader\">{}</h3>", encode_text(text))
        }
        Block::Markdown { source } => match convert_markdown_to_html(source) {
            Ok(html) => format!("<div class=\"block-markdown\">{}</div>", html),
            Err(e) => format!("<div class=\"alert alert-warning\">{}</div>", encode_text(&e)),
        },
        Block::Text { text } => format!("<p class=\"block-text\">{}</p>", encode_text(text)),
        Block::Caption { text } => format!("<p class=\"block-caption\">{}</p>", encode_text(text)),
        Block::Code { source, language } => {
            let class = language
                .as_deref()
                .map(|l| format!(" class=\"language-{}\"", encode_double_quoted_attribute(l)))
                .unwrap_or_default();
            format!(
                "<pre class=\"block-code\"><code{}>{}</code></pre>",
                class,
                encode_text(source)
            )
        }
        Block::Metric {
            label,
            value,
            delta,
        } => {
            let delta = delta
                .as_deref()
                .map(|d| {
                    let direction = if d.trim_start().starts_with('-') { "down" } else { "up" };
                    format!(
                        "<span class=\"metric-delta {}\">{}</span>",
                        direction,
                        encode_text(d)
                    )
                })
                .unwrap_or_default();
            format!(
                "<div class=\"block-metric\"><span class=\"metric-label\">{}</span><span class=\"metric-value\">{}</span>{}</div>",
                encode_text(label),
                encode_text(value),
                delta
            )
        }
        Block::Table { table } => table_to_html(table),
        Block::Json { value } => {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            format!("<pre class=\"block-json\">{}</pre>", encode_text(&pretty))
        }
        Block::Chart { chart } => chart_to_svg(chart),
        Block::Alert { level, text } => format!(
            "<div class=\"alert alert-{}\" role=\"status\">{}</div>",
            level.as_str(),
            encode_text(text)
        ),
        Block::Divider => "<hr class=\"block-divider\">".to_string(),
    }
}

pub fn table_to_html(table: &Table) -> String {
    let mut out = String::from("<div class=\"table-wrap\"><table class=\"block-table\"><thead><tr>");
    for column in &table.columns {
        let _ = write!(out, "<th>{}</th>", encode_text(column));
    }
    out.push_str("</tr></thead><tbody>");
    for row in table.rows.iter().take(MAX_TABLE_ROWS) {
        out.push_str("<tr>");
        for cell in row {
            let class = if cell.is_number() { " class=\"num\"" } else { "" };
            let _ = write!(out, "<td{}>{}</td>", class, encode_text(&cell_text(cell)));
        }
        out.push_str("</tr>");
    }
    out.push_str("</tbody></table>");
    if table.rows.len() > MAX_TABLE_ROWS {
        let _ = write!(
            out,
            "<p class=\"block-caption\">Showing {} of {} rows</p>",
            MAX_TABLE_ROWS,
            table.rows.len()
        );
    }
    out.push_str("</div>");
    out
}

const CHART_WIDTH: f64 = 640.0;
const CHART_HEIGHT: f64 = 320.0;
const MARGIN_LEFT: f64 = 56.0;
const MARGIN_RIGHT: f64 = 16.0;
const MARGIN_TOP: f64 = 32.0;
const MARGIN_BOTTOM: f64 = 48.0;

/// Inline SVG for a bar or line chart
pub fn chart_to_svg(chart: &Chart) -> String {
    let values = chart
        .series
        .iter()
        .flat_map(|s| s.values.iter().flatten().copied());
    let (min, max) = values.fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let span = if (max - min).abs() < f64::EPSILON { 1.0 } else { max - min };

    let plot_w = CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_h = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let slots = chart.labels.len().max(1) as f64;
    let slot_w = plot_w / slots;
    let y_of = |v: f64| MARGIN_TOP + plot_h - (v - min) / span * plot_h;

    let mut svg = String::new();
    let _ = write!(
        svg,
        "<figure class=\"block-chart\"><svg viewBox=\"0 0 {} {}\" role=\"img\" xmlns=\"http://www.w3.org/2000/svg\">",
        CHART_WIDTH, CHART_HEIGHT
    );
    if let Some(title) = &chart.title {
        let _ = write!(
            svg,
            "<text x=\"{}\" y=\"18\" class=\"chart-title\" text-anchor=\"middle\">{}</text>",
            CHART_WIDTH / 2.0,
            encode_text(title)
        );
    }

    // axes and y ticks
    let baseline = y_of(0.0_f64.clamp(min, max));
    let _ = write!(
        svg,
        "<line x1=\"{l}\" y1=\"{b}\" x2=\"{r}\" y2=\"{b}\" class=\"axis\"/><line x1=\"{l}\" y1=\"{t}\" x2=\"{l}\" y2=\"{bot}\" class=\"axis\"/>",
        l = MARGIN_LEFT,
        r = CHART_WIDTH - MARGIN_RIGHT,
        b = baseline,
        t = MARGIN_TOP,
        bot = MARGIN_TOP + plot_h
    );
    for tick in [min, min + span / 2.0, min + span] {
        let _ = write!(
            svg,
            "<text x=\"{}\" y=\"{:.1}\" class=\"tick\" text-anchor=\"end\">{}</text>",
            MARGIN_LEFT - 6.0,
            y_of(tick) + 4.0,
            format_tick(tick)
        );
    }
    for (i, label) in chart.labels.iter().enumerate() {
        let _ = write!(
            svg,
            "<text x=\"{:.1}\" y=\"{}\" class=\"tick\" text-anchor=\"middle\">{}</text>",
            MARGIN_LEFT + slot_w * (i as f64 + 0.5),
            CHART_HEIGHT - MARGIN_BOTTOM + 16.0,
            encode_text(label)
        );
    }

    let series_count = chart.series.len().max(1) as f64;
    for (s, series) in chart.series.iter().enumerate() {
        let color = PALETTE[s % PALETTE.len()];
        match chart.kind {
            ChartKind::Bar => {
                let bar_w = slot_w * 0.8 / series_count;
                for (i, value) in series.values.iter().enumerate() {
                    let Some(v) = value else { continue };
                    let x = MARGIN_LEFT + slot_w * i as f64 + slot_w * 0.1 + bar_w * s as f64;
                    let (top, bottom) = (y_of(v.max(0.0_f64.max(min))), y_of(v.min(0.0_f64.max(min))));
                    let _ = write!(
                        svg,
                        "<rect x=\"{:.1}\" y=\"{:.1}\" width=\"{:.1}\" height=\"{:.1}\" fill=\"{}\"><title>{}: {}</title></rect>",
                        x,
                        top,
                        bar_w,
                        (bottom - top).max(0.0),
                        color,
                        encode_text(&series.name),
                        format_tick(*v)
                    );
                }
            }
            ChartKind::Line => {
                // Gaps split the line into separate segments.
                let mut segment: Vec<String> = Vec::new();
                let points = series.values.iter().enumerate().map(|(i, v)| {
                    v.map(|v| format!("{:.1},{:.1}", MARGIN_LEFT + slot_w * (i as f64 + 0.5), y_of(v)))
                });
                for point in points.chain(std::iter::once(None)) {
                    match point {
                        Some(p) => segment.push(p),
                        None if !segment.is_empty() => {
                            let _ = write!(
                                svg,
                                "<polyline fill=\"none\" stroke=\"{}\" stroke-width=\"2\" points=\"{}\"/>",
                                color,
                                segment.join(" ")
                            );
                            segment.clear();
                        }
                        None => {}
                    }
                }
            }
        }
    }
    svg.push_str("</svg>");

    if chart.series.len() > 1 {
        svg.push_str("<figcaption class=\"chart-legend\">");
        for (s, series) in chart.series.iter().enumerate() {
            let _ = write!(
                svg,
                "<span><i style=\"background:{}\"></i>{}</span>",
                PALETTE[s % PALETTE.len()],
                encode_text(&series.name)
            );
        }
        svg.push_str("</figcaption>");
    }
    svg.push_str("</figure>");
    svg
}

fn format_tick(value: f64) -> String {
    if value.fract().abs() < 1e-9 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}
