//! Daily OSS-Fuzz coverage report scraping
//!
//! Report layout depends on the project language: LLVM-based toolchains
//! publish `file_view_index.html`, Python (coverage.py) and JVM (JaCoCo)
//! publish `index.html`. Each parser reads the summary row at the bottom of
//! the first table.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::http::FetchClient;
use crate::Result;

pub const COVERAGE_BASE_URL: &str = "https://storage.googleapis.com/oss-fuzz-coverage";

/// Report format family of a project language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFamily {
    /// c, c++, rust, swift
    Llvm,
    Python,
    Jvm,
    Unsupported,
}

impl LanguageFamily {
    pub fn from_language(language: Option<&str>) -> Self {
        match language.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("c" | "c++" | "rust" | "swift") => LanguageFamily::Llvm,
            Some("python") => LanguageFamily::Python,
            Some("jvm") => LanguageFamily::Jvm,
            _ => LanguageFamily::Unsupported,
        }
    }

    fn page(&self) -> Option<&'static str> {
        match self {
            LanguageFamily::Llvm => Some("file_view_index.html"),
            LanguageFamily::Python | LanguageFamily::Jvm => Some("index.html"),
            LanguageFamily::Unsupported => None,
        }
    }
}

/// Line counts from a report summary row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCounts {
    pub covered: i64,
    pub total: i64,
}

/// URL of the report page for a project and day, if the language is supported.
pub fn report_url(
    base: &str,
    project: &str,
    date: NaiveDate,
    family: LanguageFamily,
) -> Option<String> {
    let page = family.page()?;
    Some(format!(
        "{}/{project}/reports/{}/linux/{page}",
        base.trim_end_matches('/'),
        date.format("%Y%m%d")
    ))
}

/// Parse a report page for the given family.
pub fn parse_report(html: &str, family: LanguageFamily) -> Option<LineCounts> {
    match family {
        LanguageFamily::Llvm => parse_llvm_report(html),
        LanguageFamily::Python => parse_python_report(html),
        LanguageFamily::Jvm => parse_jvm_report(html),
        LanguageFamily::Unsupported => None,
    }
}

/// `Line Coverage` cell of the totals row, e.g. `90.00% (180/200)`.
pub fn parse_llvm_report(html: &str) -> Option<LineCounts> {
    let table = summary_table(html, "Line Coverage")?;
    let col = table.column("Line Coverage")?;
    let cell = table.last_row()?.get(col)?.replace(',', "");
    let numbers: Vec<&str> = number_re().find_iter(&cell).map(|m| m.as_str()).collect();
    if numbers.len() < 3 {
        return None;
    }
    Some(LineCounts {
        covered: parse_count(numbers[1])?,
        total: parse_count(numbers[2])?,
    })
}

/// `statements` and `missing` columns of the totals row.
pub fn parse_python_report(html: &str) -> Option<LineCounts> {
    let table = summary_table(html, "statements")?;
    let row = table.last_row()?;
    let total = parse_count(row.get(table.column("statements")?)?)?;
    let missing = parse_count(row.get(table.column("missing")?)?)?;
    counts_from_missing(total, missing)
}

/// `Lines` and the second `Missed` column (missed lines) of the totals row.
pub fn parse_jvm_report(html: &str) -> Option<LineCounts> {
    let table = summary_table(html, "Lines")?;
    let row = table.last_row()?;
    let total = parse_count(row.get(table.column("Lines")?)?)?;
    let missed_col = table
        .header
        .iter()
        .enumerate()
        .filter(|(_, h)| h.as_str() == "Missed")
        .map(|(i, _)| i)
        .nth(1)?;
    let missed = parse_count(row.get(missed_col)?)?;
    counts_from_missing(total, missed)
}

fn counts_from_missing(total: i64, missing: i64) -> Option<LineCounts> {
    if total <= 0 || missing < 0 || missing > total {
        return None;
    }
    Some(LineCounts {
        covered: total - missing,
        total,
    })
}

fn parse_count(cell: &str) -> Option<i64> {
    let cleaned: String = cell.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().map(|f| f as i64))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\d.]+").expect("static pattern"))
}

// ---------------------------------------------------------------------------
// Minimal HTML table reader
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    fn last_row(&self) -> Option<&Vec<String>> {
        self.rows.last()
    }
}

struct TablePatterns {
    table_tag: Regex,
    tfoot: Regex,
    row: Regex,
    cell: Regex,
    tag: Regex,
}

fn table_patterns() -> &'static TablePatterns {
    static P: OnceLock<TablePatterns> = OnceLock::new();
    P.get_or_init(|| TablePatterns {
        table_tag: Regex::new(r"(?i)<(/?)table\b[^>]*>").expect("static pattern"),
        tfoot: Regex::new(r"(?is)<tfoot\b[^>]*>(.*?)</tfoot>").expect("static pattern"),
        row: Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("static pattern"),
        cell: Regex::new(r"(?is)<(t[hd])\b[^>]*>(.*?)</t[hd]>").expect("static pattern"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("static pattern"),
    })
}

fn cell_text(raw: &str) -> String {
    let stripped = table_patterns().tag.replace_all(raw, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rows of a fragment as (all cells are `<th>`, cell texts).
fn rows_of(fragment: &str) -> Vec<(bool, Vec<String>)> {
    let p = table_patterns();
    p.row
        .captures_iter(fragment)
        .filter_map(|row| {
            let cells: Vec<(bool, String)> = p
                .cell
                .captures_iter(&row[1])
                .map(|c| (c[1].eq_ignore_ascii_case("th"), cell_text(&c[2])))
                .collect();
            if cells.is_empty() {
                return None;
            }
            let all_th = cells.iter().all(|(is_th, _)| *is_th);
            Some((all_th, cells.into_iter().map(|(_, t)| t).collect()))
        })
        .collect()
}

/// Body ranges of every `<table>` element, in order of their opening tags.
/// Unclosed tables are ignored.
fn table_bodies(html: &str) -> Vec<(usize, usize)> {
    let mut open = Vec::new();
    let mut spans = Vec::new();
    for tag in table_patterns().table_tag.captures_iter(html) {
        let (Some(whole), Some(slash)) = (tag.get(0), tag.get(1)) else {
            continue;
        };
        if slash.as_str().is_empty() {
            open.push((whole.start(), whole.end()));
        } else if let Some((opened_at, body_start)) = open.pop() {
            spans.push((opened_at, body_start, whole.start()));
        }
    }
    spans.sort_unstable();
    spans.into_iter().map(|(_, start, end)| (start, end)).collect()
}

/// `body` with any nested `<table>` elements cut out.
fn without_nested_tables(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut depth = 0usize;
    let mut copied_to = 0;
    for tag in table_patterns().table_tag.captures_iter(body) {
        let (Some(whole), Some(slash)) = (tag.get(0), tag.get(1)) else {
            continue;
        };
        if slash.as_str().is_empty() {
            if depth == 0 {
                out.push_str(&body[copied_to..whole.start()]);
            }
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
            if depth == 0 {
                copied_to = whole.end();
            }
        }
    }
    if depth == 0 {
        out.push_str(&body[copied_to..]);
    }
    out
}

/// The first table on the page whose header row names `column`.
///
/// Tables are tried in document order, nested ones included, each with its
/// own nested tables removed.
fn summary_table(html: &str, column: &str) -> Option<Table> {
    let found = table_bodies(html)
        .into_iter()
        .filter_map(|(start, end)| parse_table(&without_nested_tables(&html[start..end])))
        .find(|table| table.column(column).is_some());
    if found.is_none() {
        debug!(column, "No coverage table with the expected header");
    }
    found
}

/// The header is the first all-`<th>` row, or the first row when the table
/// has none. `<tfoot>` rows are ordered last wherever they appear.
fn parse_table(body: &str) -> Option<Table> {
    let p = table_patterns();
    let footer = p
        .tfoot
        .captures(body)
        .map(|c| rows_of(&c[1]))
        .unwrap_or_default();
    let main = p.tfoot.replace(body, "");

    let mut rows = rows_of(&main);
    rows.extend(footer);
    if rows.is_empty() {
        return None;
    }

    let header_idx = rows.iter().position(|(all_th, _)| *all_th).unwrap_or(0);
    let mut rows = rows.into_iter().skip(header_idx);
    let (_, header) = rows.next()?;
    Some(Table {
        header,
        rows: rows
            .filter(|(all_th, _)| !*all_th)
            .map(|(_, cells)| cells)
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Fetches and parses daily coverage reports
pub struct CoverageReportFetcher<'a> {
    client: &'a FetchClient,
    base_url: String,
}

impl<'a> CoverageReportFetcher<'a> {
    pub fn new(client: &'a FetchClient) -> Self {
        Self {
            client,
            base_url: COVERAGE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }

    /// Line counts for a project's report on `date`.
    ///
    /// `Ok(None)` when the language is unsupported, the report is absent, or
    /// its summary row cannot be read.
    pub async fn fetch(
        &self,
        project: &str,
        language: Option<&str>,
        date: NaiveDate,
    ) -> Result<Option<LineCounts>> {
        let family = LanguageFamily::from_language(language);
        let Some(url) = report_url(&self.base_url, project, date, family) else {
            debug!(project, ?language, "Coverage reports not supported for language");
            return Ok(None);
        };
        let Some(html) = self.client.get_text(&url).await? else {
            debug!(project, %date, "No coverage report for day");
            return Ok(None);
        };
        Ok(parse_report(&html, family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_families() {
        assert_eq!(LanguageFamily::from_language(Some("C++")), LanguageFamily::Llvm);
        assert_eq!(LanguageFamily::from_language(Some("rust")), LanguageFamily::Llvm);
        assert_eq!(LanguageFamily::from_language(Some("python")), LanguageFamily::Python);
        assert_eq!(LanguageFamily::from_language(Some("jvm")), LanguageFamily::Jvm);
        assert_eq!(LanguageFamily::from_language(Some("go")), LanguageFamily::Unsupported);
        assert_eq!(LanguageFamily::from_language(None), LanguageFamily::Unsupported);
    }

    #[test]
    fn report_urls() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 9).unwrap();
        assert_eq!(
            report_url(COVERAGE_BASE_URL, "zlib", date, LanguageFamily::Llvm).unwrap(),
            "https://storage.googleapis.com/oss-fuzz-coverage/zlib/reports/20240709/linux/file_view_index.html"
        );
        assert!(report_url(COVERAGE_BASE_URL, "x", date, LanguageFamily::Unsupported).is_none());
    }

    #[test]
    fn table_without_data_rows_is_absent() {
        assert!(parse_llvm_report("<table><tr><td>1</td></tr></table>").is_none());
        assert!(parse_llvm_report("<p>no tables</p>").is_none());
    }

    #[test]
    fn summary_table_is_found_past_layout_and_nested_tables() {
        let html = r#"
            <table class="layout"><tr><td>
              <table class="nav"><tr><th>Menu</th></tr><tr><td>home</td></tr></table>
              <table class="summary" width="100%">
                <tr><th>Filename</th><th>Line Coverage</th></tr>
                <tr><td>a.c</td><td>50.00% (5/10)</td></tr>
                <tr><td>b.c</td><td><table><tr><td>spark</td></tr></table>1.00% (1/100)</td></tr>
                <tr><td>Totals</td><td>90.00% (1,800/2,000)</td></tr>
              </table>
            </td></tr></table>"#;
        assert_eq!(
            parse_llvm_report(html),
            Some(LineCounts {
                covered: 1800,
                total: 2000
            })
        );
    }

    #[test]
    fn table_spans_follow_nesting() {
        let html = "<table a><tr><td><table b>x</table></td></tr></table><table c>y";
        let bodies: Vec<&str> = table_bodies(html)
            .into_iter()
            .map(|(s, e)| &html[s..e])
            .collect();
        assert_eq!(bodies, vec!["<tr><td><table b>x</table></td></tr>", "x"]);
        assert_eq!(without_nested_tables(bodies[0]), "<tr><td></td></tr>");
    }

    #[test]
    fn counts_with_thousands_separators() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count(" 12 "), Some(12));
        assert_eq!(parse_count("n/a"), None);
    }
}
