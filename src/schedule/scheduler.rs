//! Turns schedule rules into submitted plans.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::rule::{ScheduleRule, Trigger};
use crate::queue::QueueError;
use crate::store::{StateStore, StoreError};
use crate::task::PlanSpec;

/// Scheduler errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Unknown rule: {0}")]
    UnknownRule(String),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where fired rules send their plans.
pub trait PlanSink: Send + Sync {
    fn submit(&self, spec: PlanSpec) -> Result<String, QueueError>;
}

pub struct Scheduler {
    rules: Mutex<Vec<ScheduleRule>>,
    sink: Arc<dyn PlanSink>,
    store: Option<Arc<dyn StateStore>>,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn PlanSink>) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            sink,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the in-memory rules with the persisted ones.
    pub fn load_rules(&self) -> Result<usize, ScheduleError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_rules()?;
        let count = loaded.len();
        *self.rules.lock() = loaded;
        tracing::info!(rules = count, "Schedule rules loaded");
        Ok(count)
    }

    fn persist(&self, rules: &[ScheduleRule]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_rules(rules) {
                tracing::warn!("Failed to persist schedule rules: {}", e);
            }
        }
    }

    pub fn add_rule(&self, rule: ScheduleRule) -> Result<String, ScheduleError> {
        validate(&rule)?;

        let id = rule.id.clone();
        let mut rules = self.rules.lock();
        if rules.iter().any(|r| r.id == id) {
            return Err(ScheduleError::InvalidRule(format!("duplicate rule id {}", id)));
        }
        tracing::info!(rule = %id, name = %rule.name, trigger = %rule.describe(), "Rule added");
        rules.push(rule);
        self.persist(&rules);
        Ok(id)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<ScheduleRule, ScheduleError> {
        let mut rules = self.rules.lock();
        let index = rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| ScheduleError::UnknownRule(rule_id.to_string()))?;
        let removed = rules.remove(index);
        self.persist(&rules);
        Ok(removed)
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), ScheduleError> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| ScheduleError::UnknownRule(rule_id.to_string()))?;
        rule.enabled = enabled;
        tracing::info!(rule = rule_id, enabled, "Rule toggled");
        self.persist(&rules);
        Ok(())
    }

    pub fn rules(&self) -> Vec<ScheduleRule> {
        self.rules.lock().clone()
    }

    /// Fire every due rule. Returns the ids of the plans submitted.
    pub fn tick(&self, now: NaiveDateTime) -> Vec<String> {
        let mut rules = self.rules.lock();
        let mut submitted = Vec::new();
        let mut fired = false;

        for rule in rules.iter_mut().filter(|r| r.is_due(now)) {
            let mut spec = rule.template.clone();
            spec.schedule_rule = Some(rule.id.clone());
            if spec.name.trim().is_empty() {
                spec.name = rule.name.clone();
            }

            fired = true;
            match self.sink.submit(spec) {
                Ok(plan_id) => {
                    tracing::info!(rule = %rule.id, plan = %plan_id, "Rule fired");
                    rule.mark_fired(now, Some(plan_id.clone()));
                    submitted.push(plan_id);
                }
                Err(e) => {
                    // Counted as fired so a broken template is not resubmitted every tick.
                    tracing::warn!(rule = %rule.id, "Rule fired but plan was rejected: {}", e);
                    rule.mark_fired(now, None);
                }
            }
        }

        if fired {
            self.persist(&rules);
        }
        submitted
    }

    /// Tick every `every` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(every_secs = every.as_secs_f64(), "Scheduler started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick(Local::now().naive_local());
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

fn validate(rule: &ScheduleRule) -> Result<(), ScheduleError> {
    if rule.template.steps.is_empty() {
        return Err(ScheduleError::InvalidRule(format!(
            "rule {} has an empty template",
            rule.name
        )));
    }
    match rule.trigger {
        Trigger::Interval { every_secs: 0 } => Err(ScheduleError::InvalidRule(
            "interval must be at least one second".to_string(),
        )),
        Trigger::TimeWindow { start, end } if start == end => Err(ScheduleError::InvalidRule(
            "time window is empty".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime};

    #[derive(Default)]
    struct RecordingSink {
        specs: Mutex<Vec<PlanSpec>>,
    }

    impl PlanSink for RecordingSink {
        fn submit(&self, spec: PlanSpec) -> Result<String, QueueError> {
            let mut specs = self.specs.lock();
            specs.push(spec);
            Ok(format!("plan-{}", specs.len()))
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn new_scheduler() -> (Arc<RecordingSink>, Scheduler) {
        let sink = Arc::new(RecordingSink::default());
        (sink.clone(), Scheduler::new(sink))
    }

    #[test]
    fn test_once_rule_fires_exactly_once() {
        let (sink, scheduler) = new_scheduler();
        scheduler
            .add_rule(ScheduleRule::new(
                "morning",
                Trigger::Once { at: at(9, 0) },
                PlanSpec::single("打开微信"),
            ))
            .unwrap();

        assert!(scheduler.tick(at(8, 0)).is_empty());
        let mut fired = 0;
        for i in 0..1000 {
            fired += scheduler.tick(at(9, 0) + ChronoDuration::seconds(i)).len();
        }
        assert_eq!(fired, 1);
        assert_eq!(sink.specs.lock().len(), 1);

        let rule = &scheduler.rules()[0];
        assert!(!rule.enabled);
        assert_eq!(rule.last_plan_id.as_deref(), Some("plan-1"));
    }

    #[test]
    fn test_fired_plan_carries_rule_id_and_name() {
        let (sink, scheduler) = new_scheduler();
        let mut template = PlanSpec::single("check");
        template.name.clear();
        let id = scheduler
            .add_rule(ScheduleRule::new(
                "daily check",
                Trigger::Daily {
                    at: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                },
                template,
            ))
            .unwrap();

        scheduler.tick(at(9, 30));
        let specs = sink.specs.lock();
        assert_eq!(specs[0].schedule_rule.as_deref(), Some(id.as_str()));
        assert_eq!(specs[0].name, "daily check");
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let (sink, scheduler) = new_scheduler();
        let id = scheduler
            .add_rule(ScheduleRule::new(
                "r",
                Trigger::Once { at: at(9, 0) },
                PlanSpec::single("x"),
            ))
            .unwrap();
        scheduler.set_enabled(&id, false).unwrap();

        assert!(scheduler.tick(at(10, 0)).is_empty());
        assert!(sink.specs.lock().is_empty());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let (_, scheduler) = new_scheduler();
        let err = scheduler
            .add_rule(ScheduleRule::new(
                "r",
                Trigger::Interval { every_secs: 0 },
                PlanSpec::single("x"),
            ))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidRule(_)));

        let err = scheduler
            .add_rule(ScheduleRule::new(
                "r",
                Trigger::Once { at: at(9, 0) },
                PlanSpec::new("empty"),
            ))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidRule(_)));
        assert_eq!(
            scheduler.remove_rule("nope").unwrap_err(),
            ScheduleError::UnknownRule("nope".to_string())
        );
    }

    #[test]
    fn test_fire_state_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let (_, scheduler) = new_scheduler();
        let scheduler = scheduler.with_store(store.clone());
        scheduler
            .add_rule(ScheduleRule::new(
                "r",
                Trigger::Once { at: at(9, 0) },
                PlanSpec::single("x"),
            ))
            .unwrap();
        scheduler.tick(at(9, 0));

        let (sink, reloaded) = new_scheduler();
        let reloaded = reloaded.with_store(store);
        assert_eq!(reloaded.load_rules().unwrap(), 1);
        assert!(reloaded.tick(at(9, 5)).is_empty());
        assert!(sink.specs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, scheduler) = new_scheduler();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(scheduler).run(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
