//! JUnit XML output.
//!
//! One `<testcase>` per run. Runs whose tests failed get a `<failure>`;
//! runs that never got to run their tests (pull, create or start failed, or
//! the run was cancelled or timed out) get an `<error>` so CI dashboards
//! keep the two apart.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" time="12.400">
//!   <testsuite name="lth" tests="2" failures="1" errors="0" skipped="0" time="12.400" timestamp="2026-10-18T09:12:44Z">
//!     <testcase classname="lth.nodejs_20" name="nodejs:20" time="5.100"/>
//!     <testcase classname="lth.nodejs_22" name="nodejs:22" time="7.300">
//!       <failure message="tests failed with exit code 1" type="execute">1 failing</failure>
//!       <system-out>1 failing</system-out>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{BatchSummary, Reporter, RunSummary};
use crate::run::{RunResult, RunSpecification};
use crate::variant::sanitize_name;

/// Writes a JUnit XML file when the batch completes.
///
/// Parent directories are created if missing.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "lth".to_string(),
        }
    }

    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    pub fn output_path(&self) -> &std::path::Path {
        &self.output_path
    }

    /// Renders the summary as a JUnit document.
    pub fn generate_xml(&self, summary: &BatchSummary) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = summary.total.to_string();
        let failures = summary.runs.iter().filter(|r| r.tests_failed()).count();
        let errors = (summary.failed - failures).to_string();
        let failures = failures.to_string();
        let time = format!("{:.3}", summary.total_run_time().as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", timestamp.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for run in &summary.runs {
            self.write_testcase(&mut writer, run)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        run: &RunSummary,
    ) -> anyhow::Result<()> {
        let classname = format!("{}.{}", self.testsuite_name, sanitize_name(&run.variant));
        let time = format!("{:.3}", run.duration.as_secs_f64());

        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", classname.as_str()));
        testcase.push_attribute(("name", run.variant.as_str()));
        testcase.push_attribute(("time", time.as_str()));

        if run.passed() {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        writer.write_event(Event::Start(testcase))?;

        let tag = if run.tests_failed() { "failure" } else { "error" };
        let message = strip_invalid(run.message.as_deref().unwrap_or_default());
        let kind = run.stage.map(|s| s.as_str()).unwrap_or("error");

        let mut element = BytesStart::new(tag);
        element.push_attribute(("message", message.as_str()));
        element.push_attribute(("type", kind));
        writer.write_event(Event::Start(element))?;
        let body = run
            .stderr
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(run.stdout.as_deref())
            .unwrap_or(message.as_str());
        writer.write_event(Event::Text(BytesText::new(&strip_invalid(body))))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;

        for (tag, text) in [("system-out", &run.stdout), ("system-err", &run.stderr)] {
            if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                writer.write_event(Event::Start(BytesStart::new(tag)))?;
                writer.write_event(Event::Text(BytesText::new(&strip_invalid(text))))?;
                writer.write_event(Event::End(BytesEnd::new(tag)))?;
            }
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_batch_start(&self, _specs: &[RunSpecification]) {}

    async fn on_run_start(&self, _spec: &RunSpecification) {}

    async fn on_run_complete(&self, _result: &RunResult) {}

    async fn on_batch_complete(&self, summary: &BatchSummary) {
        let xml = match self.generate_xml(summary) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        if let Err(e) = std::fs::write(&self.output_path, xml) {
            tracing::error!("Failed to write JUnit XML: {}", e);
        } else {
            tracing::info!("JUnit XML written to: {}", self.output_path.display());
        }
    }
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn strip_invalid(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::run::{FailureCause, RunOutcome, Stage};
    use crate::runtime::{ExecOutput, RuntimeError};

    fn summary() -> BatchSummary {
        let spec = |variant: &str, idx: usize| {
            RunSpecification::new(format!("img/{}", variant), format!("lth-{}-{}", idx, idx))
                .variant(variant)
        };
        BatchSummary::from_results(&[
            RunResult {
                spec: spec("nodejs:20", 0),
                resource_id: Some("c0".into()),
                output: Some(ExecOutput::default()),
                outcome: RunOutcome::Succeeded,
                duration: Duration::from_millis(5100),
            },
            RunResult {
                spec: spec("nodejs:22", 1),
                resource_id: Some("c1".into()),
                output: Some(ExecOutput {
                    exit_code: 1,
                    stdout: "1 failing <expected>".into(),
                    stderr: String::new(),
                }),
                outcome: RunOutcome::failed(Stage::Execute, FailureCause::TestsFailed { exit_code: 1 }),
                duration: Duration::from_millis(7300),
            },
            RunResult {
                spec: spec("nodejs:99", 2),
                resource_id: None,
                output: None,
                outcome: RunOutcome::failed(
                    Stage::Pull,
                    RuntimeError::ImageNotFound("img/nodejs:99".into()),
                ),
                duration: Duration::from_millis(100),
            },
        ])
    }

    #[test]
    fn test_generate_xml_counts_and_cases() {
        let reporter = JUnitReporter::new("junit.xml".into());
        let xml = reporter.generate_xml(&summary()).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"<testsuites tests="3" failures="1" errors="1" time="12.500">"#));
        assert!(xml.contains(r#"<testcase classname="lth.nodejs_20" name="nodejs:20" time="5.100"/>"#));
        assert!(xml.contains(r#"<failure message="tests failed with exit code 1" type="execute">"#));
        assert!(xml.contains("1 failing &lt;expected&gt;"));
        assert!(xml.contains(r#"<error message="image not found: img/nodejs:99" type="pull">"#));
        assert!(xml.contains("<system-out>"));
    }

    #[test]
    fn test_custom_suite_name() {
        let reporter = JUnitReporter::new("junit.xml".into()).with_testsuite_name("orders-fn");
        let xml = reporter.generate_xml(&summary()).unwrap();
        assert!(xml.contains(r#"<testsuite name="orders-fn""#));
        assert!(xml.contains(r#"classname="orders-fn.nodejs_22""#));
    }

    #[test]
    fn test_strip_invalid() {
        assert_eq!(strip_invalid("a\u{0}b\u{1b}c\n"), "abc\n");
    }

    #[tokio::test]
    async fn test_writes_file_on_batch_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter.on_batch_complete(&summary()).await;

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<testsuites"));
        assert_eq!(reporter.output_path(), path.as_path());
    }
}
