//! Build-log analyser
//!
//! Classifies a Cloud Build log by project, build type, outcome and source
//! checkouts using line-oriented pattern rules.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use fuzzstudy_store::{BuildResult, BuildType};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::http::FetchClient;
use crate::raw::{append_jsonl, existing_keys, RawBuildAnalysis, RawBuildlogMeta, SourceEntry};
use crate::Result;

/// Lines from the end of the log inspected for the outcome.
const TAIL_LINES: usize = 200;

struct Patterns {
    image: Regex,
    gcs: Regex,
    starting_step: Regex,
    base_runner: Regex,
    report_html: Regex,
    runner_missing: Regex,
    compile: Regex,
    jq: Regex,
    jq_path: Regex,
    jq_type: Regex,
    jq_url: Regex,
    jq_rev: Regex,
    step_body: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static pattern");
        Patterns {
            image: re(r"Already have image: gcr\.io/oss-fuzz/([^\s:]+)"),
            gcs: re(r"No URLs matched: gs://oss-fuzz-coverage/([^/]+)/textcov_reports"),
            starting_step: re(r"^Starting Step #\d+\s*(.*)"),
            base_runner: re(r"Step #(\d+)(?: - [^:]*)?: Pulling image: gcr\.io/oss-fuzz-base/base-runner"),
            report_html: re(r"/report/.*\.html"),
            runner_missing: re(
                r"Unable to find image 'gcr\.io/oss-fuzz-base/base-runner:latest' locally",
            ),
            compile: re(r"compile-(.*)-(.*)-x86_64"),
            jq: re(r"jq_inplace [^ ]+ '(.*?)'"),
            jq_path: re(r#""(.+?)"\s*="#),
            jq_type: re(r#"type:\s*"(.+?)""#),
            jq_url: re(r#"url:\s*"(.+?)""#),
            jq_rev: re(r#"rev:\s*"(.+?)""#),
            step_body: re(r#"Step #\d+(?: - "[^"]*")?:\s?(.*)"#),
        }
    })
}

/// What the analyser extracted from one log
#[derive(Debug, Clone, PartialEq)]
pub struct LogAnalysis {
    pub project: Option<String>,
    pub build_type: Option<BuildType>,
    pub result: BuildResult,
    pub sources: Vec<SourceEntry>,
}

impl LogAnalysis {
    fn unknown() -> Self {
        Self {
            project: None,
            build_type: None,
            result: BuildResult::Unknown,
            sources: Vec::new(),
        }
    }
}

/// Classify one log text.
pub fn analyze_log(text: &str) -> LogAnalysis {
    let lines: Vec<&str> = text.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return LogAnalysis::unknown();
    }

    let p = patterns();
    let mut project: Option<String> = None;
    let mut build_type: Option<BuildType> = None;
    let mut sources = Vec::new();
    let mut json_block: Option<(String, i32)> = None;

    for line in &lines {
        if project.is_none() {
            project = p
                .image
                .captures(line)
                .or_else(|| p.gcs.captures(line))
                .map(|c| c[1].to_string());
        }

        if let Some(caps) = p.starting_step.captures(line) {
            let step = caps[1].trim().replace('"', "");
            if step.is_empty() || step.contains("srcmap") || step.contains("build") {
                continue;
            }
            build_type = Some(classify_step(&step));
        } else {
            if let Some(caps) = p.base_runner.captures(line) {
                build_type = Some(match &caps[1] {
                    "0" => BuildType::Introspector,
                    "4" => BuildType::Coverage,
                    "5" => BuildType::Fuzzing,
                    _ => BuildType::Unknown,
                });
            }
            if p.report_html.is_match(line) {
                build_type = Some(BuildType::Coverage);
            }
            if p.runner_missing.is_match(line) {
                build_type = Some(BuildType::Fuzzing);
            }
            if let Some(caps) = p.compile.captures(line) {
                build_type = Some(match &caps[2] {
                    "address" | "memory" | "undefined" | "none" => BuildType::Fuzzing,
                    "coverage" => BuildType::Coverage,
                    "introspector" => BuildType::Introspector,
                    _ => BuildType::Unknown,
                });
            }
        }

        if let Some(caps) = p.jq.captures(line) {
            if let Some(entry) = parse_jq_entry(&caps[1]) {
                sources.push(entry);
            }
        }

        // srcmap dumps: `Step #N: {` ... matching `}` spread over many lines
        match json_block.as_mut() {
            None => {
                if let Some(caps) = p.step_body.captures(line) {
                    if caps[1].trim() == "{" {
                        json_block = Some(("{".to_string(), 1));
                    }
                }
            }
            Some((buf, depth)) => {
                let body = p
                    .step_body
                    .captures(line)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| line.to_string());
                *depth += brace_delta(&body);
                buf.push_str(&body);
                if *depth <= 0 {
                    sources.extend(parse_srcmap_block(buf));
                    json_block = None;
                }
            }
        }
    }

    let result = classify_result(&lines);
    let build_type = match (result, build_type) {
        (BuildResult::Finish, Some(BuildType::Coverage)) => Some(BuildType::Coverage),
        (BuildResult::Finish, Some(BuildType::Introspector)) => Some(BuildType::Introspector),
        (BuildResult::Finish, _) => Some(BuildType::Fuzzing),
        (BuildResult::Error, None | Some(BuildType::Unknown)) => Some(BuildType::Error),
        (_, t) => t,
    };

    LogAnalysis {
        project,
        build_type,
        result,
        sources,
    }
}

fn classify_step(step: &str) -> BuildType {
    if step.contains("coverage") {
        BuildType::Coverage
    } else if step.contains("introspector") {
        BuildType::Introspector
    } else if [
        "address-x86_64",
        "undefined-x86_64",
        "memory-x86_64",
        "none-x86_64",
        "address-i386",
    ]
    .iter()
    .any(|k| step.contains(k))
    {
        BuildType::Fuzzing
    } else {
        BuildType::Unknown
    }
}

/// Outcome from the tail of the log.
fn classify_result(lines: &[&str]) -> BuildResult {
    let start = lines.len().saturating_sub(TAIL_LINES);
    let tail: Vec<&str> = lines[start..].iter().map(|l| l.trim()).collect();
    let second_last_error = lines.len() >= 2 && lines[lines.len() - 2].contains("ERROR");

    if second_last_error
        || tail
            .iter()
            .any(|l| *l == "ERROR" || *l == "ERROR: context deadline exceeded")
    {
        BuildResult::Error
    } else if tail.contains(&"PUSH") && tail.contains(&"DONE") {
        BuildResult::Finish
    } else {
        BuildResult::Halfway
    }
}

fn parse_jq_entry(content: &str) -> Option<SourceEntry> {
    let p = patterns();
    Some(SourceEntry {
        path: p.jq_path.captures(content)?[1].to_string(),
        kind: p.jq_type.captures(content)?[1].to_string(),
        url: p.jq_url.captures(content)?[1].to_string(),
        rev: p.jq_rev.captures(content)?[1].to_string(),
    })
}

fn brace_delta(s: &str) -> i32 {
    s.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

fn parse_srcmap_block(text: &str) -> Vec<SourceEntry> {
    let parsed: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(text) {
        Ok(map) => map,
        Err(e) => {
            debug!(error = %e, "Unparseable srcmap block");
            return Vec::new();
        }
    };
    let field = |v: &serde_json::Value, key: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_string()
    };
    parsed
        .into_iter()
        .map(|(path, details)| SourceEntry {
            kind: field(&details, "type"),
            url: field(&details, "url"),
            rev: field(&details, "rev"),
            path,
        })
        .collect()
}

/// Public log URL for a build id.
pub fn public_log_url(build_id: &str) -> String {
    format!("https://oss-fuzz-build-logs.storage.googleapis.com/log-{build_id}.txt")
}

/// Downloads and analyses listed logs, resuming past already-analysed ids
pub struct BuildlogAnalyzer<'a> {
    client: &'a FetchClient,
    pause: Duration,
    limit: Option<usize>,
}

impl<'a> BuildlogAnalyzer<'a> {
    pub fn new(client: &'a FetchClient) -> Self {
        Self {
            client,
            pause: Duration::ZERO,
            limit: None,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Analyse at most `limit` new logs per invocation.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Download and classify one log. Download failures yield result Unknown.
    pub async fn analyze(&self, meta: &RawBuildlogMeta) -> RawBuildAnalysis {
        let build_id = meta.build_id().to_string();
        let url = meta
            .media_link
            .clone()
            .unwrap_or_else(|| public_log_url(&build_id));

        let analysis = match self.client.get_text(&url).await {
            Ok(Some(text)) => analyze_log(&text),
            Ok(None) => {
                warn!(build_id = %build_id, "Build log not found");
                LogAnalysis::unknown()
            }
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Build log download failed");
                LogAnalysis::unknown()
            }
        };

        RawBuildAnalysis {
            build_id: build_id.clone(),
            project: analysis.project,
            build_type: analysis.build_type,
            result: analysis.result,
            time_created: meta.time_created.clone(),
            size_bytes: meta.size_bytes(),
            sources: analysis.sources,
            log_url: Some(public_log_url(&build_id)),
        }
    }

    /// Analyse listed logs not yet present in `out_path`, appending each result.
    #[instrument(skip(self, metas), fields(listed = metas.len()))]
    pub async fn run(&self, metas: &[RawBuildlogMeta], out_path: &Path) -> Result<usize> {
        let done = existing_keys(out_path, |a: &RawBuildAnalysis| a.build_id.clone())?;
        let todo: Vec<&RawBuildlogMeta> = metas
            .iter()
            .filter(|m| !done.contains(m.build_id()))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        info!(already = done.len(), pending = todo.len(), "Analysing build logs");

        for (i, meta) in todo.iter().enumerate() {
            let record = self.analyze(meta).await;
            debug!(
                build_id = %record.build_id,
                project = ?record.project,
                build_type = ?record.build_type,
                result = %record.result,
                "Analysed build log"
            );
            append_jsonl(out_path, std::slice::from_ref(&record))?;
            if i + 1 < todo.len() && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        Ok(todo.len())
    }
}
