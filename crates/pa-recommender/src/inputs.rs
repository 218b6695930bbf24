use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use pa_common::{SessionRecord, VisitorProfile};

/// Visitor profile extract produced by the upstream registration processing.
pub fn load_visitors(path: &Path) -> anyhow::Result<Vec<VisitorProfile>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read visitor extract {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("malformed visitor extract {}", path.display()))
}

/// Session catalog extract, embeddings already attached upstream.
pub fn load_sessions(path: &Path) -> anyhow::Result<Vec<SessionRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read session extract {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("malformed session extract {}", path.display()))
}

/// Prior-cycle attendance pairs (badge_id, session_id), merged into the
/// visitor profiles' history sets.
pub fn apply_attendance(path: &Path, visitors: &mut [VisitorProfile]) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot read attendance extract {}", path.display()))?;
    let headers = reader.headers().context("attendance extract has no headers")?;
    let badge_col = find_column(headers, &["badge_id", "badge", "visitor_id"])
        .context("attendance extract has no badge column")?;
    let session_col = find_column(headers, &["session_id", "session"])
        .context("attendance extract has no session column")?;

    let index_by_badge: HashMap<String, usize> = visitors
        .iter()
        .enumerate()
        .map(|(i, v)| (v.badge_id.clone(), i))
        .collect();

    let mut applied = 0;
    for record in reader.records() {
        let record = record.context("malformed attendance row")?;
        let badge = record.get(badge_col).map(str::trim).unwrap_or_default();
        let session = record.get(session_col).map(str::trim).unwrap_or_default();
        if badge.is_empty() || session.is_empty() {
            continue;
        }
        if let Some(&index) = index_by_badge.get(badge) {
            visitors[index].attended_sessions.insert(session.to_string());
            applied += 1;
        }
    }
    Ok(applied)
}

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.iter().any(|a| h.trim().eq_ignore_ascii_case(a)))
}

/// Incremental runs drop visitors already flagged from a prior run before
/// the engine ever sees them. Returns (kept, skipped count).
pub fn filter_incremental(
    visitors: Vec<VisitorProfile>,
    create_only_new: bool,
) -> (Vec<VisitorProfile>, usize) {
    if !create_only_new {
        return (visitors, 0);
    }
    let before = visitors.len();
    let kept: Vec<VisitorProfile> = visitors
        .into_iter()
        .filter(|v| !v.has_recommendation)
        .collect();
    let skipped = before - kept.len();
    (kept, skipped)
}
