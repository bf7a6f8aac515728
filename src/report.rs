use crate::error::Error;
use crate::project::{ArchiveResult, ArchiveStatus};
use anyhow::{Context, Result};
use bytesize::ByteSize;
use chrono::{SecondsFormat, Utc};
use console::style;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct MissingProject {
    pub id: u64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub archived_at: String,
    pub results: Vec<ArchiveResult>,
    pub missing: Vec<MissingProject>,
    pub interrupted: bool,
    /// Set when `index.json` could not be written.
    #[serde(skip)]
    pub index_error: Option<String>,
}

impl RunReport {
    pub fn new(missing: Vec<(u64, Error)>) -> Self {
        RunReport {
            archived_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            results: Vec::new(),
            missing: missing
                .into_iter()
                .map(|(id, e)| MissingProject {
                    id,
                    reason: e.to_string(),
                })
                .collect(),
            interrupted: false,
            index_error: None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArchiveResult> {
        self.results.iter().filter(|r| r.status.is_failure())
    }

    /// Failed archives plus ids that could not be resolved.
    pub fn failure_count(&self) -> usize {
        self.failures().count() + self.missing.len()
    }

    /// Anything that should turn the exit status into a partial failure.
    pub fn has_errors(&self) -> bool {
        self.failure_count() > 0 || self.index_error.is_some()
    }

    pub fn write_index(&self, outdir: &Path) -> Result<()> {
        let path = outdir.join("index.json");
        let json = serde_json::to_vec_pretty(self).with_context(|| "Failed to serialize run report")?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        log::debug!("Wrote index: path={:?}", path);
        Ok(())
    }

    pub fn print_summary(&self) {
        for result in &self.results {
            let path = &result.project.path_with_namespace;
            match &result.status {
                ArchiveStatus::Archived { size_bytes } => println!(
                    "{} {} ({}) -> {}",
                    style("✓").green(),
                    path,
                    ByteSize(*size_bytes),
                    result.output_path.display()
                ),
                ArchiveStatus::DryRun => println!(
                    "{} {} -> {} (dry-run)",
                    style("·").dim(),
                    path,
                    result.output_path.display()
                ),
                ArchiveStatus::Failed { .. } => {
                    println!("{} {}", style("✗").red(), path)
                }
            }
        }

        let failed: Vec<&ArchiveResult> = self.failures().collect();
        if !failed.is_empty() || !self.missing.is_empty() {
            println!("\n{}", style("Failures:").red().bold());
            for missing in &self.missing {
                println!("  project id {}: {}", missing.id, missing.reason);
            }
            for result in &failed {
                if let ArchiveStatus::Failed { reason } = &result.status {
                    println!(
                        "  {} (id={}): {}",
                        result.project.path_with_namespace, result.project.id, reason
                    );
                }
            }
        }
        if let Some(e) = &self.index_error {
            println!("\n{} {}", style("index.json not written:").red().bold(), e);
        }

        let archived = self.results.len() - failed.len();
        let total_bytes: u64 = self
            .results
            .iter()
            .map(|r| match r.status {
                ArchiveStatus::Archived { size_bytes } => size_bytes,
                _ => 0,
            })
            .sum();
        println!(
            "\n{} archived, {} failed, {} on disk{}",
            style(archived).green().bold(),
            style(failed.len() + self.missing.len()).red().bold(),
            ByteSize(total_bytes),
            if self.interrupted {
                style(" (interrupted)").yellow().to_string()
            } else {
                String::new()
            }
        );
    }
}
