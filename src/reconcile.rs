use chrono::{DateTime, Local, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use crate::model::{CapabilityEvent, HealthStateMap, ServiceState, ServiceTargetState};

const DISPLAY_FORMAT: &str = "%B %-d, %Y, %H:%M %Z";

const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(DISPLAY_FORMAT).to_string()
}

/// Accepts RFC 3339 strings, epoch milliseconds, and epoch seconds with an
/// optional fraction.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            raw.parse::<f64>().ok().and_then(from_epoch)
        }
        Value::Number(number) => number.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let millis = if value >= EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

pub fn display_timestamp(value: Option<&Value>, now: DateTime<Local>) -> String {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return format_timestamp(now);
    };
    match parse_timestamp(value) {
        Some(parsed) => format_timestamp(parsed.with_timezone(&Local)),
        None => {
            debug!(timestamp = %value, "unreadable server timestamp, using receipt time");
            format_timestamp(now)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub tools: HealthStateMap,
    pub resources: HealthStateMap,
}

impl HealthSnapshot {
    pub fn sample_for(&self, service_name: &str) -> Option<&ServiceState> {
        self.tools
            .get(service_name)
            .and_then(|samples| samples.first())
            .or_else(|| {
                self.resources
                    .get(service_name)
                    .and_then(|samples| samples.first())
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reduction {
    pub changed: bool,
    /// Set after REGISTER: the id whose live health should be fetched.
    pub refresh: Option<String>,
}

/// The reconciled capability collection. Ids are unique at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    entries: Vec<ServiceTargetState>,
}

impl CapabilitySet {
    pub fn new(entries: Vec<ServiceTargetState>) -> Self {
        let mut set = Self::default();
        for entry in entries {
            set.insert(entry);
        }
        set
    }

    pub fn entries(&self) -> &[ServiceTargetState] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceTargetState> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ServiceTargetState> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    fn insert(&mut self, entry: ServiceTargetState) {
        self.entries.retain(|existing| existing.id != entry.id);
        self.entries.push(entry);
    }

    pub fn apply(&mut self, event: &CapabilityEvent, now: DateTime<Local>) -> Reduction {
        match event {
            CapabilityEvent::Update { id, state } => {
                let Some(entry) = self.get_mut(id) else {
                    return Reduction::default();
                };
                let state = state.as_ref();
                entry.active = state.and_then(|state| state.healthy);
                entry.last_seen = Some(display_timestamp(
                    state.and_then(|state| state.timestamp.as_ref()),
                    now,
                ));
                entry.reason = state.and_then(|state| state.reason.clone());
                Reduction {
                    changed: true,
                    refresh: None,
                }
            }
            CapabilityEvent::Ping { id } => {
                let Some(entry) = self.get_mut(id) else {
                    return Reduction::default();
                };
                entry.active = Some(true);
                entry.last_seen = Some(format_timestamp(now));
                Reduction {
                    changed: true,
                    refresh: None,
                }
            }
            CapabilityEvent::Register { id, target } => {
                self.entries
                    .retain(|existing| existing.id != *id && existing.id != target.id);
                self.entries.push(target.clone());
                Reduction {
                    changed: true,
                    refresh: Some(target.id.clone()),
                }
            }
            CapabilityEvent::Deregister { id } => {
                let before = self.entries.len();
                self.entries.retain(|entry| entry.id != *id);
                Reduction {
                    changed: self.entries.len() != before,
                    refresh: None,
                }
            }
        }
    }

    pub fn merge_health(&mut self, health: &HealthSnapshot, now: DateTime<Local>) {
        for entry in &mut self.entries {
            merge_entry_health(entry, health, now);
        }
    }

    /// Folds health samples into a single entry. Returns false when the id is
    /// no longer present.
    pub fn merge_health_for(
        &mut self,
        id: &str,
        health: &HealthSnapshot,
        now: DateTime<Local>,
    ) -> bool {
        match self.get_mut(id) {
            Some(entry) => {
                merge_entry_health(entry, health, now);
                true
            }
            None => false,
        }
    }
}

pub fn reduce(
    current: &CapabilitySet,
    event: &CapabilityEvent,
    now: DateTime<Local>,
) -> (CapabilitySet, Reduction) {
    let mut next = current.clone();
    let reduction = next.apply(event, now);
    (next, reduction)
}

fn merge_entry_health(entry: &mut ServiceTargetState, health: &HealthSnapshot, now: DateTime<Local>) {
    let sample = entry
        .service_name()
        .and_then(|name| health.sample_for(name))
        .cloned();

    match sample {
        Some(sample) => {
            entry.active = sample.healthy;
            entry.reason = sample.reason;
            entry.last_seen = Some(display_timestamp(sample.timestamp.as_ref(), now));
        }
        None => {
            let raw = entry.last_seen.take().map(Value::String);
            entry.last_seen = Some(display_timestamp(raw.as_ref(), now));
        }
    }
}
