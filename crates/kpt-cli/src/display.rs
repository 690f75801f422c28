//! Display formatting for CLI output
//!
//! Human-readable progress goes to stderr so that stdout stays free for
//! resource streams (`--output stdout|unwrap`).

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::time::Duration;

use kpt_core::{Conflict, Severity, UpstreamLock, WriteSummary};
use kpt_engine::{FunctionResult, FunctionResultList};
use kpt_repo::UpdateSummary;

/// Pluralize a word based on count
pub fn pluralize(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{} {}", count, singular)
    } else {
        format!("{} {}", count, plural)
    }
}

/// Spinner shown while an upstream is fetched
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        bar.set_style(template);
    }
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Short form of a lock: `repo/dir@commit` or `image@digest`
pub fn describe_lock(lock: &UpstreamLock) -> String {
    if let Some(git) = &lock.git {
        let short = git.commit.get(..7).unwrap_or(&git.commit);
        format!("{}{}@{}", git.repo, display_dir(&git.directory), short)
    } else if let Some(oci) = &lock.oci {
        if oci.digest.is_empty() {
            oci.image.clone()
        } else {
            format!("{}@{}", oci.image, oci.digest)
        }
    } else {
        "unknown upstream".to_string()
    }
}

fn display_dir(dir: &str) -> &str {
    if dir == "/" { "" } else { dir }
}

/// Writes progress and reports for the commands
pub struct Reporter {
    writer: Box<dyn Write>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    /// Create a new reporter that writes to stderr
    pub fn new() -> Self {
        Self {
            writer: Box::new(io::stderr()),
        }
    }

    /// Create a reporter that writes to a custom writer (for testing)
    pub fn with_writer<W: Write + 'static>(writer: W) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    pub fn success(&mut self, message: impl AsRef<str>) -> io::Result<()> {
        writeln!(self.writer, "{} {}", style("✓").green().bold(), message.as_ref())
    }

    /// One line per executed function, followed by its result items
    pub fn function_results(&mut self, results: &FunctionResultList) -> io::Result<()> {
        for result in &results.items {
            self.function_result(result)?;
        }
        Ok(())
    }

    fn function_result(&mut self, result: &FunctionResult) -> io::Result<()> {
        let failed = result.exit_code != 0 || result.has_errors();
        let status = if failed {
            style("[FAIL]").red().bold()
        } else {
            style("[PASS]").green().bold()
        };
        writeln!(self.writer, "{} {}", status, style(result.id()).cyan())?;

        for item in &result.results {
            let icon = match item.severity {
                Severity::Error => style("✗").red(),
                Severity::Warning => style("⚠").yellow(),
                Severity::Info => style("ℹ").blue(),
            };
            writeln!(self.writer, "  {} {}", icon, item)?;
        }

        if failed && !result.stderr.trim().is_empty() {
            writeln!(self.writer, "  {}", style("stderr:").dim())?;
            for line in result.stderr.lines() {
                writeln!(self.writer, "    {}", line)?;
            }
        }
        Ok(())
    }

    /// Files touched by an in-place or directory write
    pub fn write_summary(&mut self, summary: &WriteSummary) -> io::Result<()> {
        for path in &summary.written {
            writeln!(self.writer, "  {} {}", style("wrote").green(), path)?;
        }
        for path in &summary.pruned {
            writeln!(self.writer, "  {} {}", style("pruned").yellow(), path)?;
        }
        if !summary.unchanged.is_empty() {
            writeln!(
                self.writer,
                "  {}",
                style(format!(
                    "{} unchanged",
                    pluralize(summary.unchanged.len(), "file", "files")
                ))
                .dim()
            )?;
        }
        Ok(())
    }

    pub fn conflicts(&mut self, conflicts: &[Conflict]) -> io::Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        writeln!(
            self.writer,
            "{} {}:",
            style("⚠").yellow().bold(),
            pluralize(conflicts.len(), "conflict", "conflicts")
        )?;
        for conflict in conflicts {
            writeln!(self.writer, "  {}", conflict)?;
        }
        Ok(())
    }

    pub fn update_summary(&mut self, pkg: &str, summary: &UpdateSummary) -> io::Result<()> {
        self.conflicts(&summary.conflicts)?;
        let from = summary
            .previous
            .as_ref()
            .map(describe_lock)
            .unwrap_or_else(|| "no recorded revision".to_string());
        self.success(format!(
            "Updated {} from {} to {} ({})",
            style(pkg).cyan(),
            from,
            describe_lock(&summary.lock),
            summary.strategy
        ))
    }
}
