//! Text rendering for CLI output.
//!
//! Formats the status card, notices and the artifact panel as plain lines.

use crate::artifacts::{CanonicalArtifact, CanonicalArtifacts};
use crate::error::FetchError;
use crate::geo::BoundingBox;
use crate::model::{Mode, Run, RunStatus};
use crate::poller::Notice;
use crate::storage::RecentRun;

const DASH: &str = "—";

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn progress_bar(progress: f64, width: usize) -> String {
    let filled = (progress * width as f64).round() as usize;
    let filled = filled.min(width);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

/// Status card for one fetched run.
pub(crate) fn build_status_lines(run_id: &str, mode: Mode, run: &Run) -> TextSummary {
    let mut lines = Vec::new();
    lines.push(format!("Run {run_id} ({mode})"));
    lines.push(format!("  Status:   {}", run.status));
    lines.push(format!(
        "  Stage:    {}",
        run.stage.as_deref().unwrap_or(DASH)
    ));
    match run.progress {
        Some(p) => lines.push(format!(
            "  Progress: {} {}%",
            progress_bar(p, 20),
            (p * 100.0).round()
        )),
        None => lines.push(format!("  Progress: {DASH}")),
    }
    lines.push(format!(
        "  Created:  {}",
        run.created_at.as_deref().unwrap_or(DASH)
    ));
    lines.push(format!(
        "  Updated:  {}",
        run.updated_at.as_deref().unwrap_or(DASH)
    ));
    if run.status == RunStatus::Failed {
        lines.push("Run failed".to_string());
        lines.push(format!(
            "  {}",
            run.failure_detail()
                .unwrap_or("No error message provided by API.")
        ));
    }
    if mode == Mode::Demo {
        lines.push(
            "Demo run: this is a precomputed demo. Artifacts may not have download links available."
                .to_string(),
        );
    }
    TextSummary { lines }
}

/// Inline notice for a failed fetch.
pub(crate) fn build_error_lines(error: &FetchError, notice: Notice) -> TextSummary {
    let lines = match notice {
        Notice::Unauthorized => vec![
            "Unauthorized (401)".to_string(),
            "  Set or replace your key with `citylens key set <KEY>`.".to_string(),
        ],
        Notice::QuotaExceeded => vec![
            "Quota exceeded (429)".to_string(),
            "  Please wait and try again.".to_string(),
        ],
        Notice::NotFoundInDemo => vec![
            "Run not found in demo data (404)".to_string(),
            "  Drop --demo or set an API key to look it up on the live backend.".to_string(),
        ],
        Notice::Transient => {
            let mut lines = vec!["Error loading run".to_string(), format!("  {error}")];
            if let Some(detail) = error.detail() {
                lines.push(format!("  {detail}"));
            }
            lines
        }
    };
    TextSummary { lines }
}

/// Artifact panel: one line per canonical file.
pub(crate) fn build_artifact_lines(artifacts: &CanonicalArtifacts) -> TextSummary {
    let expected: Vec<_> = CanonicalArtifact::ALL.iter().map(|a| a.file_name()).collect();
    let mut lines = vec![format!("Artifacts (expected: {})", expected.join(", "))];
    for slot in artifacts.iter() {
        let name = slot.artifact.file_name();
        let line = match slot.url.as_deref() {
            Some(url) if slot.is_downloadable() => format!("  {name:<17} {url}"),
            _ if slot.present => format!("  {name:<17} present, no signed_url available yet"),
            _ => format!("  {name:<17} missing"),
        };
        lines.push(line);
        if let Some(size) = slot.record.as_ref().and_then(|r| r.size_bytes) {
            lines.push(format!("  {:<17} {} bytes", "", size));
        }
    }
    TextSummary { lines }
}

pub(crate) fn build_bounds_line(bounds: Option<&BoundingBox>) -> String {
    match bounds {
        Some(b) if b.is_degenerate() => {
            let (lat, lon) = b.center();
            format!("Viewport: zero-area box centered on {lat:.6}, {lon:.6}")
        }
        Some(b) => format!(
            "Viewport: south {:.6} west {:.6} north {:.6} east {:.6}",
            b.south, b.west, b.north, b.east
        ),
        None => "No mappable geometry found in GeoJSON.".to_string(),
    }
}

pub(crate) fn build_history_lines(runs: &[RecentRun]) -> TextSummary {
    if runs.is_empty() {
        return TextSummary {
            lines: vec!["No runs yet. Submit one with `citylens submit <PAYLOAD>`.".to_string()],
        };
    }
    let lines = runs
        .iter()
        .map(|r| {
            format!(
                "{:<40} status: {:<10} {}",
                r.run_id,
                r.last_known_status.as_deref().unwrap_or("(unknown)"),
                r.touched_at
            )
        })
        .collect();
    TextSummary { lines }
}
