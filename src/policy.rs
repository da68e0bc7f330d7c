//! Booking policy: business hours, holidays, spacing, hold timeouts and the service catalog.
//!
//! The policy is loaded from a JSON file and can be swapped at runtime. Every engine
//! operation takes one [`Arc`] snapshot up front and works against it to the end, so a
//! reload never changes the rules halfway through a booking.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::model::{MINUTE_MS, Ms};

/// Opening hours of one weekday, in minutes after local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayHours {
    pub open_minute: i64,
    pub close_minute: i64,
}

/// Holds made at most `max_lead_minutes` before the appointment start live for
/// `timeout_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldTimeoutTier {
    pub max_lead_minutes: i64,
    pub timeout_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDef {
    pub id: String,
    pub category: String,
    pub duration_minutes: i64,
    /// Minor currency units.
    pub price: i64,
    #[serde(default)]
    pub deposit: i64,
}

/// Catalog lookup result for one requested set of services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSelection {
    pub service_ids: Vec<String>,
    pub category: String,
    pub total_duration_ms: Ms,
    pub price_total: i64,
    pub deposit_amount: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingPolicy {
    pub utc_offset_minutes: i32,
    /// Indexed by `Weekday::num_days_from_monday()`; `None` means closed.
    pub business_hours: [Option<DayHours>; 7],
    pub holidays: BTreeSet<NaiveDate>,
    pub buffer_minutes: i64,
    pub min_advance_notice_days: u32,
    pub slot_granularity_minutes: i64,
    /// Sorted by `max_lead_minutes`.
    pub hold_timeouts: Vec<HoldTimeoutTier>,
    pub default_hold_timeout_minutes: i64,
    /// Shortest lifetime a hold may get. Windows starting sooner than this are not
    /// offered, since their hold would lapse before the customer could pay.
    pub min_hold_minutes: i64,
    pub services: HashMap<String, ServiceDef>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        let weekday = Some(DayHours {
            open_minute: 9 * 60,
            close_minute: 18 * 60,
        });
        Self {
            utc_offset_minutes: 0,
            business_hours: [weekday, weekday, weekday, weekday, weekday, None, None],
            holidays: BTreeSet::new(),
            buffer_minutes: 10,
            min_advance_notice_days: 0,
            slot_granularity_minutes: 15,
            hold_timeouts: vec![HoldTimeoutTier {
                max_lead_minutes: 24 * 60,
                timeout_minutes: 10,
            }],
            default_hold_timeout_minutes: 30,
            min_hold_minutes: 5,
            services: HashMap::new(),
        }
    }
}

impl BookingPolicy {
    pub fn buffer_ms(&self) -> Ms {
        self.buffer_minutes * MINUTE_MS
    }

    pub fn granularity_ms(&self) -> Ms {
        self.slot_granularity_minutes * MINUTE_MS
    }

    pub fn min_hold_ms(&self) -> Ms {
        self.min_hold_minutes * MINUTE_MS
    }

    pub fn offset_ms(&self) -> Ms {
        self.utc_offset_minutes as Ms * MINUTE_MS
    }

    pub fn hours_for(&self, weekday: Weekday) -> Option<DayHours> {
        self.business_hours[weekday.num_days_from_monday() as usize]
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Hold lifetime for an appointment starting `lead` ms from now.
    /// Never reaches past the appointment start.
    pub fn hold_timeout(&self, lead: Ms) -> Ms {
        let minutes = self
            .hold_timeouts
            .iter()
            .find(|tier| lead <= tier.max_lead_minutes * MINUTE_MS)
            .map_or(self.default_hold_timeout_minutes, |tier| tier.timeout_minutes);
        (minutes * MINUTE_MS).min(lead.max(0))
    }

    /// Validate a requested service list against the catalog and price it.
    pub fn select_services(&self, ids: &[String]) -> Result<ServiceSelection, PolicyError> {
        if ids.is_empty() {
            return Err(PolicyError::Catalog("no services requested".into()));
        }
        let mut seen = HashSet::new();
        let mut category: Option<&str> = None;
        let mut selection = ServiceSelection {
            service_ids: Vec::with_capacity(ids.len()),
            category: String::new(),
            total_duration_ms: 0,
            price_total: 0,
            deposit_amount: 0,
        };
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(PolicyError::Catalog(format!("service {id} requested twice")));
            }
            let svc = self
                .services
                .get(id)
                .ok_or_else(|| PolicyError::Catalog(format!("unknown service {id}")))?;
            match category {
                None => category = Some(&svc.category),
                Some(c) if c != svc.category => {
                    return Err(PolicyError::Catalog(format!(
                        "services span categories {c} and {}",
                        svc.category
                    )));
                }
                Some(_) => {}
            }
            selection.service_ids.push(id.clone());
            selection.total_duration_ms += svc.duration_minutes * MINUTE_MS;
            selection.price_total += svc.price;
            selection.deposit_amount += svc.deposit;
        }
        selection.category = category.unwrap_or_default().to_string();
        Ok(selection)
    }
}

// ── JSON form ─────────────────────────────────────────────────────

fn default_buffer() -> i64 {
    10
}

fn default_granularity() -> i64 {
    15
}

fn default_hold_timeout() -> i64 {
    30
}

fn default_min_hold() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    utc_offset_minutes: i32,
    /// `{"mon": ["09:00", "18:00"], ...}`; missing weekdays are closed.
    #[serde(default)]
    business_hours: BTreeMap<String, [String; 2]>,
    #[serde(default)]
    holidays: Vec<NaiveDate>,
    #[serde(default = "default_buffer")]
    buffer_minutes: i64,
    #[serde(default)]
    min_advance_notice_days: u32,
    #[serde(default = "default_granularity")]
    slot_granularity_minutes: i64,
    #[serde(default)]
    hold_timeouts: Vec<HoldTimeoutTier>,
    #[serde(default = "default_hold_timeout")]
    default_hold_timeout_minutes: i64,
    #[serde(default = "default_min_hold")]
    min_hold_minutes: i64,
    #[serde(default)]
    services: Vec<ServiceDef>,
}

fn parse_hhmm(s: &str) -> Result<i64, PolicyError> {
    let bad = || PolicyError::Invalid(format!("bad time of day: {s}"));
    let (h, m) = s.split_once(':').ok_or_else(bad)?;
    let h: i64 = h.trim().parse().map_err(|_| bad())?;
    let m: i64 = m.trim().parse().map_err(|_| bad())?;
    if !(0..=24).contains(&h) || !(0..60).contains(&m) || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

pub fn parse_policy(json: &str) -> Result<BookingPolicy, PolicyError> {
    let raw: RawPolicy =
        serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))?;

    if !(-14 * 60..=14 * 60).contains(&raw.utc_offset_minutes) {
        return Err(PolicyError::Invalid("utc_offset_minutes out of range".into()));
    }
    if raw.buffer_minutes < 0 {
        return Err(PolicyError::Invalid("buffer_minutes must not be negative".into()));
    }
    if !(1..=24 * 60).contains(&raw.slot_granularity_minutes) {
        return Err(PolicyError::Invalid("slot_granularity_minutes out of range".into()));
    }
    if raw.default_hold_timeout_minutes <= 0 {
        return Err(PolicyError::Invalid("default_hold_timeout_minutes must be positive".into()));
    }
    if raw.min_hold_minutes <= 0 {
        return Err(PolicyError::Invalid("min_hold_minutes must be positive".into()));
    }

    let mut business_hours = [None; 7];
    for (day, [open, close]) in &raw.business_hours {
        let weekday: Weekday = day
            .parse()
            .map_err(|_| PolicyError::Invalid(format!("unknown weekday: {day}")))?;
        let hours = DayHours {
            open_minute: parse_hhmm(open)?,
            close_minute: parse_hhmm(close)?,
        };
        if hours.open_minute >= hours.close_minute {
            return Err(PolicyError::Invalid(format!("{day}: opens after it closes")));
        }
        business_hours[weekday.num_days_from_monday() as usize] = Some(hours);
    }

    let mut hold_timeouts = raw.hold_timeouts;
    if hold_timeouts.iter().any(|t| t.timeout_minutes <= 0 || t.max_lead_minutes < 0) {
        return Err(PolicyError::Invalid("hold timeout tiers must be positive".into()));
    }
    hold_timeouts.sort_by_key(|t| t.max_lead_minutes);

    let mut services = HashMap::with_capacity(raw.services.len());
    for svc in raw.services {
        if svc.duration_minutes <= 0 || svc.price < 0 || !(0..=svc.price).contains(&svc.deposit) {
            return Err(PolicyError::Invalid(format!("service {}: bad duration or price", svc.id)));
        }
        if services.insert(svc.id.clone(), svc).is_some() {
            return Err(PolicyError::Invalid("duplicate service id in catalog".into()));
        }
    }

    Ok(BookingPolicy {
        utc_offset_minutes: raw.utc_offset_minutes,
        business_hours,
        holidays: raw.holidays.into_iter().collect(),
        buffer_minutes: raw.buffer_minutes,
        min_advance_notice_days: raw.min_advance_notice_days,
        slot_granularity_minutes: raw.slot_granularity_minutes,
        hold_timeouts,
        default_hold_timeout_minutes: raw.default_hold_timeout_minutes,
        min_hold_minutes: raw.min_hold_minutes,
        services,
    })
}

pub fn load_policy_file(path: &Path) -> Result<BookingPolicy, PolicyError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PolicyError::Io(format!("{}: {e}", path.display())))?;
    parse_policy(&text)
}

// ── Hot-reloadable handle ─────────────────────────────────────────

/// Shared, swappable policy. Readers take a snapshot; writers replace it whole.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<BookingPolicy>>,
    source: Option<PathBuf>,
}

impl PolicyHandle {
    pub fn new(policy: BookingPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
            source: None,
        }
    }

    pub fn from_file(path: PathBuf) -> Result<Self, PolicyError> {
        let policy = load_policy_file(&path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(policy)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<BookingPolicy> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, policy: BookingPolicy) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(policy);
    }

    /// Re-read the source file. On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<(), PolicyError> {
        let Some(path) = &self.source else {
            return Ok(());
        };
        let policy = load_policy_file(path)?;
        self.replace(policy);
        tracing::info!("booking policy reloaded from {}", path.display());
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    Io(String),
    Parse(String),
    Invalid(String),
    Catalog(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Io(e) => write!(f, "policy file: {e}"),
            PolicyError::Parse(e) => write!(f, "policy parse error: {e}"),
            PolicyError::Invalid(e) => write!(f, "invalid policy: {e}"),
            PolicyError::Catalog(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PolicyError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SALON: &str = r#"{
        "utc_offset_minutes": 180,
        "business_hours": {"mon": ["10:00", "20:00"], "sat": ["11:00", "16:30"]},
        "holidays": ["2026-01-01"],
        "buffer_minutes": 15,
        "min_advance_notice_days": 1,
        "slot_granularity_minutes": 30,
        "hold_timeouts": [
            {"max_lead_minutes": 4320, "timeout_minutes": 30},
            {"max_lead_minutes": 1440, "timeout_minutes": 10}
        ],
        "default_hold_timeout_minutes": 60,
        "services": [
            {"id": "lash_classic", "category": "lashes", "duration_minutes": 120, "price": 2500, "deposit": 500},
            {"id": "lash_lower", "category": "lashes", "duration_minutes": 20, "price": 500},
            {"id": "brow_tint", "category": "brows", "duration_minutes": 30, "price": 800, "deposit": 100}
        ]
    }"#;

    #[test]
    fn parses_salon_policy() {
        let p = parse_policy(SALON).unwrap();
        assert_eq!(p.offset_ms(), 180 * MINUTE_MS);
        assert_eq!(
            p.hours_for(Weekday::Mon),
            Some(DayHours { open_minute: 600, close_minute: 1200 })
        );
        assert_eq!(
            p.hours_for(Weekday::Sat),
            Some(DayHours { open_minute: 660, close_minute: 990 })
        );
        assert_eq!(p.hours_for(Weekday::Sun), None);
        assert!(p.is_holiday(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()));
        assert_eq!(p.buffer_ms(), 15 * MINUTE_MS);
        assert_eq!(p.granularity_ms(), 30 * MINUTE_MS);
        // Tiers come back sorted.
        assert_eq!(p.hold_timeouts[0].max_lead_minutes, 1440);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let p = parse_policy("{}").unwrap();
        assert_eq!(p.buffer_minutes, 10);
        assert_eq!(p.slot_granularity_minutes, 15);
        assert_eq!(p.min_hold_ms(), 5 * MINUTE_MS);
        assert!(p.business_hours.iter().all(Option::is_none));
    }

    #[test]
    fn hold_timeout_follows_lead_time() {
        let p = parse_policy(SALON).unwrap();
        let h = 60 * MINUTE_MS;
        // Same day: shortest tier.
        assert_eq!(p.hold_timeout(5 * h), 10 * MINUTE_MS);
        // Two days out: middle tier.
        assert_eq!(p.hold_timeout(48 * h), 30 * MINUTE_MS);
        // Beyond every tier: default.
        assert_eq!(p.hold_timeout(30 * 24 * h), 60 * MINUTE_MS);
        // Never past the appointment start.
        assert_eq!(p.hold_timeout(4 * MINUTE_MS), 4 * MINUTE_MS);
    }

    #[test]
    fn rejects_inverted_hours() {
        let err = parse_policy(r#"{"business_hours": {"tue": ["18:00", "09:00"]}}"#).unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_weekday_and_bad_time() {
        assert!(parse_policy(r#"{"business_hours": {"funday": ["09:00", "10:00"]}}"#).is_err());
        assert!(parse_policy(r#"{"business_hours": {"mon": ["9am", "10:00"]}}"#).is_err());
        assert!(parse_policy(r#"{"business_hours": {"mon": ["09:00", "24:30"]}}"#).is_err());
    }

    #[test]
    fn rejects_deposit_above_price() {
        let json = r#"{"services": [{"id": "x", "category": "c", "duration_minutes": 10, "price": 100, "deposit": 200}]}"#;
        assert!(parse_policy(json).is_err());
    }

    #[test]
    fn select_services_prices_and_times() {
        let p = parse_policy(SALON).unwrap();
        let sel = p
            .select_services(&["lash_classic".into(), "lash_lower".into()])
            .unwrap();
        assert_eq!(sel.category, "lashes");
        assert_eq!(sel.total_duration_ms, 140 * MINUTE_MS);
        assert_eq!(sel.price_total, 3000);
        assert_eq!(sel.deposit_amount, 500);
    }

    #[test]
    fn select_services_rejects_mixed_categories() {
        let p = parse_policy(SALON).unwrap();
        let err = p
            .select_services(&["lash_classic".into(), "brow_tint".into()])
            .unwrap_err();
        assert!(err.to_string().contains("categories"));
    }

    #[test]
    fn select_services_rejects_unknown_duplicate_and_empty() {
        let p = parse_policy(SALON).unwrap();
        assert!(p.select_services(&[]).is_err());
        assert!(p.select_services(&["nope".into()]).is_err());
        assert!(
            p.select_services(&["lash_lower".into(), "lash_lower".into()])
                .is_err()
        );
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = PolicyHandle::new(BookingPolicy::default());
        let before = handle.snapshot();
        let mut next = BookingPolicy::default();
        next.buffer_minutes = 0;
        handle.replace(next);
        assert_eq!(before.buffer_minutes, 10);
        assert_eq!(handle.snapshot().buffer_minutes, 0);
    }

    #[test]
    fn reload_keeps_old_policy_on_bad_file() {
        let dir = std::env::temp_dir().join("slotlock_test_policy");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reload.json");
        std::fs::write(&path, r#"{"buffer_minutes": 5}"#).unwrap();

        let handle = PolicyHandle::from_file(path.clone()).unwrap();
        assert_eq!(handle.snapshot().buffer_minutes, 5);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().buffer_minutes, 5);

        std::fs::write(&path, r#"{"buffer_minutes": 20}"#).unwrap();
        handle.reload().unwrap();
        assert_eq!(handle.snapshot().buffer_minutes, 20);
    }
}
