//! Component F: Structured Logger. A hand-written, user- and CI-facing
//! formatter, kept deliberately separate from the `tracing` subscriber
//! that handles this crate's own internal diagnostics — the line shapes
//! here (`[HH:MM:SS]`, `── … ──`, `▸`/`✓`/`✗`, GitHub Actions `::group::`
//! markers) are a wire contract meant for capture through an SSH channel
//! by a CI log collector, not debug output.

use crate::engine::{DeployOutcome, ServiceOutcome};
use chrono::Local;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};

const RULE_WIDTH: usize = 60;

/// Whether we're running under GitHub Actions, gating `::group::` output
/// and the step summary file.
fn in_github_actions() -> bool {
    env::var("GITHUB_ACTIONS").as_deref() == Ok("true")
}

/// `── <label> ──` padded with more dashes out to `RULE_WIDTH`.
fn rule(label: &str) -> String {
    let head = format!("── {label} ──");
    let pad = RULE_WIDTH.saturating_sub(head.chars().count());
    format!("{head}{}", "─".repeat(pad))
}

pub struct Logger {
    github_actions: bool,
}

impl Default for Logger {
    fn default() -> Self {
        Logger { github_actions: in_github_actions() }
    }
}

impl Logger {
    pub fn new() -> Self {
        Logger::default()
    }

    fn timestamp(&self) -> String {
        Local::now().format("[%H:%M:%S]").to_string()
    }

    pub fn line(&self, message: &str) {
        println!("{} {}", self.timestamp(), message);
    }

    /// Entry/exit markers for the whole run, `── <label> ──…`.
    pub fn section(&self, label: &str) {
        self.line(&rule(label));
    }

    pub fn group_start(&self, service: &str) {
        if self.github_actions {
            println!("::group::{service}");
        }
    }

    pub fn group_end(&self) {
        if self.github_actions {
            println!("::endgroup::");
        }
    }

    pub fn service_start(&self, service: &str) {
        self.line(&format!("▸ {service}"));
    }

    pub fn service_ok(&self, service: &str, elapsed_secs: u64) {
        self.line(&format!("  ✓ {service} deployed ({elapsed_secs}s)"));
    }

    pub fn service_failed(&self, service: &str, reason: &str) {
        self.line(&format!("  reason: {reason}"));
        self.line(&format!("  ✗ {service} FAILED"));
        if self.github_actions {
            println!("::error::{service} failed: {reason}");
        }
    }

    pub fn service_skipped(&self, service: &str) {
        self.line(&format!("  - {service}: skipped (earlier service failed)"));
    }

    /// Emits the full per-service trace and, under GitHub Actions,
    /// appends a markdown table to `$GITHUB_STEP_SUMMARY`.
    pub fn report(&self, outcome: &DeployOutcome) {
        let tag_display = outcome.tag.as_deref().unwrap_or("manifest default");
        let title = if outcome.dry_run {
            format!("deploy (dry run): {tag_display}")
        } else {
            format!("deploy: {tag_display}")
        };
        self.section(&title);

        for result in &outcome.results {
            self.group_start(&result.name);
            self.service_start(&result.name);
            match &result.outcome {
                ServiceOutcome::Succeeded => self.service_ok(&result.name, result.elapsed_secs),
                ServiceOutcome::Failed(reason) => self.service_failed(&result.name, reason),
                ServiceOutcome::Skipped => self.service_skipped(&result.name),
            }
            self.group_end();
        }

        if outcome.success() {
            self.section(&format!("complete ({}s)", outcome.elapsed_secs));
        } else {
            self.section("FAILED (deploy aborted)");
        }

        if self.github_actions {
            if let Err(e) = write_step_summary(outcome) {
                self.line(&format!("warning: failed to write step summary: {e}"));
            }
        }
    }
}

fn write_step_summary(outcome: &DeployOutcome) -> io::Result<()> {
    let Ok(path) = env::var("GITHUB_STEP_SUMMARY") else {
        return Ok(());
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "## Deploy: {}", outcome.tag.as_deref().unwrap_or("manifest default"))?;
    writeln!(file, "| service | outcome | elapsed |")?;
    writeln!(file, "|---|---|---|")?;
    for result in &outcome.results {
        let outcome_text = match &result.outcome {
            ServiceOutcome::Succeeded => "✓ succeeded".to_string(),
            ServiceOutcome::Failed(reason) => format!("✗ failed: {reason}"),
            ServiceOutcome::Skipped => "- skipped".to_string(),
        };
        writeln!(file, "| {} | {} | {}s |", result.name, outcome_text, result.elapsed_secs)?;
    }
    Ok(())
}
