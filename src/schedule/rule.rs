//! Time-based schedule rules.
//!
//! All times are local wall-clock times without an offset, the way a user
//! writes "every day at 09:00".

use chrono::{Datelike, Duration, Local, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::PlanSpec;

/// When a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Once, at or after `at`.
    Once { at: NaiveDateTime },
    /// Every `every_secs`, anchored at rule creation.
    Interval { every_secs: u64 },
    /// Once per day, at or after `at`.
    Daily { at: NaiveTime },
    /// Once per window instance; `end < start` crosses midnight.
    TimeWindow { start: NaiveTime, end: NaiveTime },
}

/// Time-of-day range `[start, end)`; wraps past midnight when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Start of the window instance containing `now`, if `now` is inside one.
    pub fn instance_start(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let t = now.time();
        if !self.contains(t) {
            return None;
        }
        let today = now.date().and_time(self.start);
        if self.start <= self.end || t >= self.start {
            Some(today)
        } else {
            Some(today - Duration::days(1))
        }
    }
}

/// A recurring or one-shot plan template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    /// Days the rule may fire on; empty means every day.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    /// Extra time-of-day gate applied to every trigger.
    #[serde(default)]
    pub active_window: Option<TimeRange>,
    pub enabled: bool,
    pub template: PlanSpec,
    pub created_at: NaiveDateTime,
    /// First fire.
    #[serde(default)]
    pub fired_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_fired: Option<NaiveDateTime>,
    #[serde(default)]
    pub fire_count: u32,
    /// Plan created by the latest fire.
    #[serde(default)]
    pub last_plan_id: Option<String>,
}

impl ScheduleRule {
    pub fn new(name: impl Into<String>, trigger: Trigger, template: PlanSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            trigger,
            weekdays: Vec::new(),
            active_window: None,
            enabled: true,
            template,
            created_at: Local::now().naive_local(),
            fired_at: None,
            last_fired: None,
            fire_count: 0,
            last_plan_id: None,
        }
    }

    pub fn on_weekdays(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        self.weekdays = weekdays.into_iter().collect();
        self
    }

    pub fn within(mut self, window: TimeRange) -> Self {
        self.active_window = Some(window);
        self
    }

    fn gates_open(&self, now: NaiveDateTime) -> bool {
        if !self.weekdays.is_empty() && !self.weekdays.contains(&now.weekday()) {
            return false;
        }
        self.active_window
            .map_or(true, |window| window.contains(now.time()))
    }

    /// Whether the rule should fire at `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        if !self.enabled || !self.gates_open(now) {
            return false;
        }

        match &self.trigger {
            Trigger::Once { at } => self.fired_at.is_none() && now >= *at,
            Trigger::Interval { every_secs } => {
                if *every_secs == 0 {
                    return false;
                }
                let anchor = self.last_fired.unwrap_or(self.created_at);
                now - anchor >= Duration::seconds(*every_secs as i64)
            }
            Trigger::Daily { at } => {
                now.time() >= *at
                    && self
                        .last_fired
                        .map_or(true, |last| last.date() != now.date())
            }
            Trigger::TimeWindow { start, end } => {
                match TimeRange::new(*start, *end).instance_start(now) {
                    Some(instance) => self.last_fired.map_or(true, |last| last < instance),
                    None => false,
                }
            }
        }
    }

    /// Record a fire at `now`; a `once` rule disables itself.
    pub fn mark_fired(&mut self, now: NaiveDateTime, plan_id: Option<String>) {
        if self.fired_at.is_none() {
            self.fired_at = Some(now);
        }
        self.last_fired = Some(now);
        self.fire_count += 1;
        self.last_plan_id = plan_id;

        if matches!(self.trigger, Trigger::Once { .. }) {
            self.enabled = false;
        }
    }

    /// Earliest trigger time after `now`, ignoring the weekday and window gates.
    pub fn next_run(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.enabled {
            return None;
        }
        match &self.trigger {
            Trigger::Once { at } => self.fired_at.is_none().then_some((*at).max(now)),
            Trigger::Interval { every_secs } => {
                if *every_secs == 0 {
                    return None;
                }
                let anchor = self.last_fired.unwrap_or(self.created_at);
                Some((anchor + Duration::seconds(*every_secs as i64)).max(now))
            }
            Trigger::Daily { at } => {
                let today = now.date().and_time(*at);
                let fired_today = self.last_fired.is_some_and(|l| l.date() == now.date());
                if today > now || (!fired_today && today <= now) {
                    Some(today.max(now))
                } else {
                    Some(today + Duration::days(1))
                }
            }
            Trigger::TimeWindow { start, .. } => {
                if self.is_due(now) {
                    return Some(now);
                }
                let today = now.date().and_time(*start);
                Some(if today > now {
                    today
                } else {
                    today + Duration::days(1)
                })
            }
        }
    }

    /// Trigger summary for listings.
    pub fn describe(&self) -> String {
        let base = match &self.trigger {
            Trigger::Once { at } => format!("once at {}", at.format("%Y-%m-%d %H:%M")),
            Trigger::Interval { every_secs } => format!("every {}s", every_secs),
            Trigger::Daily { at } => format!("daily at {}", at.format("%H:%M")),
            Trigger::TimeWindow { start, end } => {
                format!("between {} and {}", start.format("%H:%M"), end.format("%H:%M"))
            }
        };
        if self.weekdays.is_empty() {
            base
        } else {
            let days: Vec<String> = self.weekdays.iter().map(|d| d.to_string()).collect();
            format!("{} on {}", base, days.join(","))
        }
    }
}
