use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::config::CapacityLimitsConfig;
use crate::stats::CapacityStatistics;
use crate::{SessionRecord, VisitorRecommendations};

/// Grouping identity for competing recommendations: `theatre|date|time` when
/// the schedule is known, else `theatre|session_id` so the session sits in
/// its own slot unless another row collides exactly.
pub type SlotKey = String;

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub key: SlotKey,
    /// Normalized theatre name used for capacity lookup.
    pub theatre: String,
    /// Human-readable label for removal notes.
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct CapacityPlan {
    /// Normalized theatre name -> configured capacity. Absent means uncapped.
    pub capacities: HashMap<String, u32>,
    /// Session id -> slot assignment.
    pub slots: HashMap<String, Slot>,
}

/// Tri-state loader outcome. A missing or unusable capacity input disables
/// the feature for the run instead of failing it; recommendation delivery is
/// never blocked by a bad capacity file.
#[derive(Debug, Clone)]
pub enum CapacitySetup {
    Enabled(CapacityPlan),
    Disabled { reason: String },
}

impl CapacitySetup {
    pub fn plan(&self) -> Option<&CapacityPlan> {
        match self {
            CapacitySetup::Enabled(plan) => Some(plan),
            CapacitySetup::Disabled { .. } => None,
        }
    }
}

pub fn normalize_theatre(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn make_slot_key(theatre: &str, date: Option<&str>, time: Option<&str>, session_id: &str) -> SlotKey {
    match (date, time) {
        (Some(date), Some(time)) => format!("{theatre}|{date}|{time}"),
        _ => format!("{theatre}|{session_id}"),
    }
}

/// Slot key for a catalog session, used by per-visitor overlap resolution.
/// `None` when the theatre is unknown; such a session never clashes.
pub fn session_slot_key(session: &SessionRecord) -> Option<SlotKey> {
    let theatre = session.theatre.as_deref()?;
    let theatre = normalize_theatre(theatre);
    if theatre.is_empty() {
        return None;
    }
    let date = session.date.map(|d| d.to_string());
    let time = session.start_time.map(|t| t.to_string());
    Some(make_slot_key(
        &theatre,
        date.as_deref(),
        time.as_deref(),
        &session.session_id,
    ))
}

// Accepted header spellings per logical column, matched case-insensitively
// and resolved once per file.
const THEATRE_ALIASES: &[&str] = &["theatre", "theater", "venue", "room", "location"];
const CAPACITY_ALIASES: &[&str] = &["capacity", "seats", "max_capacity", "limit"];
const SESSION_ALIASES: &[&str] = &["session_id", "session", "id"];
const DATE_ALIASES: &[&str] = &["date", "session_date", "day"];
const TIME_ALIASES: &[&str] = &["start_time", "time", "start"];

fn find_column(headers: &csv::StringRecord, aliases: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| aliases.iter().any(|a| h.trim().eq_ignore_ascii_case(a)))
}

/// Load the capacity plan from the configured support files. Every failure
/// path returns `Disabled` with a reason; the caller logs it exactly once.
pub fn load_capacity_plan(config: &CapacityLimitsConfig) -> CapacitySetup {
    if !config.enabled {
        return CapacitySetup::Disabled {
            reason: "theatre capacity enforcement disabled in configuration".into(),
        };
    }
    let (Some(capacity_file), Some(session_file)) = (&config.capacity_file, &config.session_file)
    else {
        return CapacitySetup::Disabled {
            reason: "capacity or session support file not configured".into(),
        };
    };

    let capacities = match load_capacities(capacity_file) {
        Ok(map) if !map.is_empty() => map,
        Ok(_) => {
            return CapacitySetup::Disabled {
                reason: format!("no usable rows in capacity file {}", capacity_file.display()),
            }
        }
        Err(reason) => return CapacitySetup::Disabled { reason },
    };

    let slots = match load_slots(session_file) {
        Ok(map) if !map.is_empty() => map,
        Ok(_) => {
            return CapacitySetup::Disabled {
                reason: format!("no usable rows in session file {}", session_file.display()),
            }
        }
        Err(reason) => return CapacitySetup::Disabled { reason },
    };

    CapacitySetup::Enabled(CapacityPlan { capacities, slots })
}

fn load_capacities(path: &Path) -> Result<HashMap<String, u32>, String> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| format!("cannot read capacity file {}: {e}", path.display()))?;
    let headers = reader
        .headers()
        .map_err(|e| format!("cannot read capacity headers: {e}"))?
        .clone();

    let theatre_col = find_column(&headers, THEATRE_ALIASES)
        .ok_or_else(|| format!("capacity file {} has no theatre column", path.display()))?;
    let capacity_col = find_column(&headers, CAPACITY_ALIASES)
        .ok_or_else(|| format!("capacity file {} has no capacity column", path.display()))?;

    let mut capacities = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("malformed capacity row: {e}"))?;
        let theatre = record.get(theatre_col).map(normalize_theatre);
        let capacity = record
            .get(capacity_col)
            .and_then(|v| v.trim().parse::<u32>().ok());
        match (theatre, capacity) {
            (Some(theatre), Some(capacity)) if !theatre.is_empty() => {
                capacities.insert(theatre, capacity);
            }
            _ => {
                tracing::warn!(row = ?record, "skipping capacity row without theatre/capacity");
            }
        }
    }
    Ok(capacities)
}

fn load_slots(path: &Path) -> Result<HashMap<String, Slot>, String> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| format!("cannot read session file {}: {e}", path.display()))?;
    let headers = reader
        .headers()
        .map_err(|e| format!("cannot read session headers: {e}"))?
        .clone();

    let session_col = find_column(&headers, SESSION_ALIASES)
        .ok_or_else(|| format!("session file {} has no session column", path.display()))?;
    let theatre_col = find_column(&headers, THEATRE_ALIASES)
        .ok_or_else(|| format!("session file {} has no theatre column", path.display()))?;
    let date_col = find_column(&headers, DATE_ALIASES);
    let time_col = find_column(&headers, TIME_ALIASES);

    let mut slots = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("malformed session row: {e}"))?;
        let session_id = record.get(session_col).map(str::trim).unwrap_or_default();
        let theatre_raw = record.get(theatre_col).map(str::trim).unwrap_or_default();
        if session_id.is_empty() || theatre_raw.is_empty() {
            tracing::warn!(row = ?record, "skipping session row without id/theatre");
            continue;
        }
        let theatre = normalize_theatre(theatre_raw);
        let date = date_col
            .and_then(|c| record.get(c))
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let time = time_col
            .and_then(|c| record.get(c))
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let key = make_slot_key(&theatre, date, time, session_id);
        let label = match (date, time) {
            (Some(date), Some(time)) => format!("{theatre_raw} {date} {time}"),
            _ => theatre_raw.to_string(),
        };
        slots.insert(
            session_id.to_string(),
            Slot {
                key,
                theatre,
                label,
            },
        );
    }
    Ok(slots)
}

/// Global, single-pass trim of over-subscribed slots across all visitors'
/// ranked lists. Runs strictly after every visitor's ranking is complete.
pub struct CapacityEnforcer<'a> {
    plan: &'a CapacityPlan,
    multiplier: f64,
}

impl<'a> CapacityEnforcer<'a> {
    pub fn new(plan: &'a CapacityPlan, multiplier: f64) -> Self {
        Self { plan, multiplier }
    }

    /// Trims each known-capacity slot to `floor(capacity * multiplier)`,
    /// keeping the highest-scoring entries. Entries without slot metadata or
    /// without a configured capacity pass through untouched but are counted.
    /// Running this twice over its own output is a no-op.
    pub fn enforce(&self, lists: &mut [VisitorRecommendations], stats: &mut CapacityStatistics) {
        // slot key -> (capacity, [(visitor index, session id, score)])
        let mut buckets: BTreeMap<SlotKey, (u32, Vec<(usize, String, f64)>)> = BTreeMap::new();

        for (visitor_idx, list) in lists.iter().enumerate() {
            for entry in &list.entries {
                let Some(slot) = self.plan.slots.get(&entry.session_id) else {
                    stats.sessions_missing_metadata += 1;
                    continue;
                };
                let Some(capacity) = self.plan.capacities.get(&slot.theatre) else {
                    stats.sessions_without_capacity += 1;
                    continue;
                };
                buckets
                    .entry(slot.key.clone())
                    .or_insert_with(|| (*capacity, Vec::new()))
                    .1
                    .push((visitor_idx, entry.session_id.clone(), entry.score));
            }
        }

        for (_, (capacity, mut members)) in buckets {
            let allowance = (capacity as f64 * self.multiplier).floor() as usize;
            if members.len() <= allowance {
                continue;
            }

            // Deterministic trim order: score desc, then badge id, then
            // session id, so unchanged input always trims the same entries.
            members.sort_by(|a, b| {
                b.2.partial_cmp(&a.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| lists[a.0].visitor.badge_id.cmp(&lists[b.0].visitor.badge_id))
                    .then_with(|| a.1.cmp(&b.1))
            });

            stats.limited_slots += 1;
            for (visitor_idx, session_id, score) in members.split_off(allowance) {
                let list = &mut lists[visitor_idx];
                let label = self
                    .plan
                    .slots
                    .get(&session_id)
                    .map(|s| s.label.clone())
                    .unwrap_or_else(|| session_id.clone());
                list.entries.retain(|e| e.session_id != session_id);
                list.notes.push(format!(
                    "Removed '{session_id}' (score {score:.2}): slot '{label}' limited to {allowance} seats"
                ));
                stats.removed_entries += 1;
                tracing::debug!(
                    badge_id = %list.visitor.badge_id,
                    session_id = %session_id,
                    allowance,
                    "capacity trim"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Rationale, RecommendationEntry, VisitorProfile};
    use std::io::Write;

    fn list(badge: &str, entries: &[(&str, f64)]) -> VisitorRecommendations {
        let mut v = VisitorRecommendations::new(VisitorProfile {
            badge_id: badge.into(),
            ..VisitorProfile::default()
        });
        v.entries = entries
            .iter()
            .map(|(id, score)| RecommendationEntry {
                session_id: id.to_string(),
                score: *score,
                rationale: Rationale::SimilarVisitor,
                notes: Vec::new(),
            })
            .collect();
        v
    }

    fn plan_with(theatre: &str, capacity: u32, sessions: &[&str]) -> CapacityPlan {
        let theatre_norm = normalize_theatre(theatre);
        let mut plan = CapacityPlan::default();
        plan.capacities.insert(theatre_norm.clone(), capacity);
        for id in sessions {
            plan.slots.insert(
                id.to_string(),
                Slot {
                    key: format!("{theatre_norm}|2026-06-01|10:00:00"),
                    theatre: theatre_norm.clone(),
                    label: format!("{theatre} 2026-06-01 10:00:00"),
                },
            );
        }
        plan
    }

    #[test]
    fn trims_oversubscribed_slot_keeping_highest_scores() {
        // Main Hall capacity 2, three visitors recommending t1 in the same slot.
        let plan = plan_with("Main Hall", 2, &["t1"]);
        let mut lists = vec![
            list("A", &[("t1", 0.9)]),
            list("B", &[("t1", 0.7)]),
            list("C", &[("t1", 0.5)]),
        ];
        let mut stats = CapacityStatistics::default();

        CapacityEnforcer::new(&plan, 1.0).enforce(&mut lists, &mut stats);

        assert_eq!(lists[0].entries.len(), 1);
        assert_eq!(lists[1].entries.len(), 1);
        assert!(lists[2].entries.is_empty());
        assert_eq!(lists[2].notes.len(), 1);
        assert!(lists[2].notes[0].contains("t1"));
        assert_eq!(stats.removed_entries, 1);
        assert_eq!(stats.limited_slots, 1);
    }

    #[test]
    fn enforcement_is_idempotent() {
        let plan = plan_with("Main Hall", 1, &["t1"]);
        let mut lists = vec![list("A", &[("t1", 0.9)]), list("B", &[("t1", 0.7)])];
        let mut stats = CapacityStatistics::default();

        CapacityEnforcer::new(&plan, 1.0).enforce(&mut lists, &mut stats);
        let after_first = lists.clone();
        let removed_first = stats.removed_entries;

        CapacityEnforcer::new(&plan, 1.0).enforce(&mut lists, &mut stats);

        assert_eq!(lists, after_first);
        assert_eq!(stats.removed_entries, removed_first);
    }

    #[test]
    fn zero_multiplier_empties_every_known_slot() {
        let plan = plan_with("Main Hall", 5, &["t1"]);
        let mut lists = vec![list("A", &[("t1", 0.9)]), list("B", &[("t1", 0.7)])];
        let mut stats = CapacityStatistics::default();

        CapacityEnforcer::new(&plan, 0.0).enforce(&mut lists, &mut stats);

        assert!(lists.iter().all(|l| l.entries.is_empty()));
        assert_eq!(stats.removed_entries, 2);
        assert_eq!(lists[0].notes.len(), 1);
        assert_eq!(lists[1].notes.len(), 1);
    }

    #[test]
    fn unknown_sessions_and_uncapped_theatres_pass_through() {
        let mut plan = plan_with("Main Hall", 1, &["t1"]);
        // t2 sits in a theatre with no configured capacity.
        plan.slots.insert(
            "t2".into(),
            Slot {
                key: "annex|t2".into(),
                theatre: "annex".into(),
                label: "Annex".into(),
            },
        );
        let mut lists = vec![list("A", &[("t2", 0.4), ("mystery", 0.3)])];
        let mut stats = CapacityStatistics::default();

        CapacityEnforcer::new(&plan, 1.0).enforce(&mut lists, &mut stats);

        assert_eq!(lists[0].entries.len(), 2);
        assert_eq!(stats.sessions_missing_metadata, 1);
        assert_eq!(stats.sessions_without_capacity, 1);
        assert_eq!(stats.removed_entries, 0);
    }

    #[test]
    fn missing_files_disable_the_feature() {
        let config = CapacityLimitsConfig {
            enabled: true,
            capacity_multiplier: 1.0,
            capacity_file: Some("/nonexistent/capacity.csv".into()),
            session_file: Some("/nonexistent/sessions.csv".into()),
        };

        match load_capacity_plan(&config) {
            CapacitySetup::Disabled { reason } => assert!(reason.contains("capacity")),
            CapacitySetup::Enabled(_) => panic!("expected fail-open disable"),
        }
    }

    #[test]
    fn loads_plan_with_aliased_headers() {
        let dir = tempfile::tempdir().unwrap();
        let capacity_path = dir.path().join("capacity.csv");
        let session_path = dir.path().join("sessions.csv");

        let mut f = std::fs::File::create(&capacity_path).unwrap();
        writeln!(f, "Venue,Seats").unwrap();
        writeln!(f, "Main  Hall,150").unwrap();

        let mut f = std::fs::File::create(&session_path).unwrap();
        writeln!(f, "Session,Theater,Date,Start").unwrap();
        writeln!(f, "t1,Main Hall,2026-06-01,10:00").unwrap();
        writeln!(f, "t2,Main Hall,2026-06-01,10:00").unwrap();
        writeln!(f, "t3,Main Hall,,").unwrap();

        let config = CapacityLimitsConfig {
            enabled: true,
            capacity_multiplier: 1.0,
            capacity_file: Some(capacity_path),
            session_file: Some(session_path),
        };

        let CapacitySetup::Enabled(plan) = load_capacity_plan(&config) else {
            panic!("plan should load");
        };
        assert_eq!(plan.capacities.get("main hall"), Some(&150));
        // t1 and t2 collide on theatre/date/time; t3 degrades to its own slot.
        assert_eq!(plan.slots["t1"].key, plan.slots["t2"].key);
        assert_ne!(plan.slots["t3"].key, plan.slots["t1"].key);
    }

    #[test]
    fn missing_columns_disable_the_feature() {
        let dir = tempfile::tempdir().unwrap();
        let capacity_path = dir.path().join("capacity.csv");
        let session_path = dir.path().join("sessions.csv");

        let mut f = std::fs::File::create(&capacity_path).unwrap();
        writeln!(f, "name,value").unwrap();
        writeln!(f, "Main Hall,150").unwrap();
        std::fs::File::create(&session_path).unwrap();

        let config = CapacityLimitsConfig {
            enabled: true,
            capacity_multiplier: 1.0,
            capacity_file: Some(capacity_path),
            session_file: Some(session_path),
        };

        assert!(matches!(
            load_capacity_plan(&config),
            CapacitySetup::Disabled { .. }
        ));
    }
}
