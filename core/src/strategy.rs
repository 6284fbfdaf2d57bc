//! C8 — Strategy Engine: periodic scheduler, AND/OR condition matcher,
//! effective-time windows, debounce and action dispatch. Grounded on
//! `AutoStrategyManager::evaluateStrategies` / `checkEffectiveTime`.

use crate::can::codec::Action;
use crate::sensors::SensorTable;
use std::collections::HashMap;

#[cfg(test)]
fn sensor_table_with(entries: &[(&str, f64)]) -> SensorTable {
    use crate::sensors::LocalSensorConfig;
    let mut table = SensorTable::new();
    for (channel, (sensor_id, value)) in entries.iter().enumerate() {
        table.register_local(LocalSensorConfig {
            sensor_id: sensor_id.to_string(),
            node: 1,
            channel: channel as u8,
            scale: 1.0,
            offset: 0.0,
        });
        table.update_local(1, channel as u8, *value, 0);
    }
    table
}

/// Tolerance applied to numeric condition comparisons.
pub const CONDITION_EPSILON: f64 = 0.1;
/// Minimum gap between two firings of the same strategy.
pub const MIN_REFIRE_MS: i64 = 10_000;
/// How long a tombstone survives before it's GC'd.
pub const DELETED_STRATEGY_TTL_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyType {
    Scene,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sensor_id: String,
    pub op: ConditionOp,
    pub threshold: f64,
}

/// `identifier` is `node_<n>_sw<c>` with a 1-based channel; `value` is the
/// raw action code (0=Stop, 1=Forward, 2=Reverse).
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyAction {
    pub identifier: String,
    pub value: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub strategy_type: StrategyType,
    pub version: u32,
    pub enabled: bool,
    pub match_type: MatchType,
    pub effective_begin: Option<String>,
    pub effective_end: Option<String>,
    pub actions: Vec<StrategyAction>,
    pub conditions: Vec<Condition>,
    pub last_triggered_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedStrategy {
    pub deleted_version: u32,
    pub deleted_ms: i64,
}

/// Outcome of a `delete` call, distinguishing an already-tombstoned
/// strategy from one that was never known at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyDeleted,
    NotFound,
}

/// One strategy's firing: the control writes it wants applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FireResult {
    pub strategy_id: String,
    pub strategy_name: String,
    pub writes: Vec<(u32, u8, Action)>,
}

/// Wall-clock time of day, minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn parse(hhmm: &str) -> Option<Self> {
        let (h, m) = hhmm.split_once(':')?;
        let hour: u8 = h.parse().ok()?;
        let minute: u8 = m.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self { hour, minute })
    }
}

#[derive(Default)]
pub struct StrategyEngine {
    strategies: HashMap<String, Strategy>,
    deleted: HashMap<String, DeletedStrategy>,
}

impl StrategyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `id` exists: bump stored `version`, ignore the incoming one, and
    /// keep `last_triggered_ms`. Otherwise append with `version` defaulted
    /// to 1.
    pub fn create_or_update(&mut self, mut strategy: Strategy) -> &Strategy {
        let id = strategy.id.clone();
        if let Some(existing) = self.strategies.get(&id) {
            strategy.version = existing.version + 1;
            strategy.last_triggered_ms = existing.last_triggered_ms;
        } else if strategy.version == 0 {
            strategy.version = 1;
        }
        self.strategies.insert(id.clone(), strategy);
        self.strategies.get(&id).expect("just inserted")
    }

    pub fn delete(&mut self, id: &str, now_ms: i64) -> DeleteOutcome {
        if self.deleted.contains_key(id) {
            return DeleteOutcome::AlreadyDeleted;
        }
        match self.strategies.remove(id) {
            Some(strategy) => {
                self.deleted.insert(
                    id.to_string(),
                    DeletedStrategy {
                        deleted_version: strategy.version,
                        deleted_ms: now_ms,
                    },
                );
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NotFound,
        }
    }

    pub fn set_id(&mut self, old: &str, new: String) -> Result<(), String> {
        if self.strategies.contains_key(&new) {
            return Err(format!("strategy id {new} already exists"));
        }
        let Some(mut strategy) = self.strategies.remove(old) else {
            return Err(format!("strategy id {old} not found"));
        };
        strategy.id = new.clone();
        self.strategies.insert(new, strategy);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Strategy> {
        self.strategies.get(id)
    }

    /// All live (non-deleted) strategies, order unspecified.
    pub fn list(&self) -> Vec<&Strategy> {
        self.strategies.values().collect()
    }

    /// Flip a strategy's `enabled` flag. Returns `false` if `id` is unknown.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.strategies.get_mut(id) {
            Some(strategy) => {
                strategy.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Manually fire a strategy, bypassing the effective-time window and
    /// debounce gates (an explicit trigger is the caller overriding the
    /// schedule) but still honoring conditions and the `enabled` flag.
    pub fn force_fire(&mut self, id: &str, now_ms: i64, sensors: &SensorTable) -> Option<FireResult> {
        let strategy = self.strategies.get(id)?;
        if !strategy.enabled {
            return None;
        }
        if !conditions_pass(strategy, sensors) {
            return None;
        }
        let writes: Vec<(u32, u8, Action)> = strategy.actions.iter().filter_map(parse_action).collect();
        let name = strategy.name.clone();
        let strategy = self.strategies.get_mut(id).expect("checked above");
        strategy.last_triggered_ms = Some(now_ms);
        Some(FireResult {
            strategy_id: id.to_string(),
            strategy_name: name,
            writes,
        })
    }

    /// Drop tombstones older than [`DELETED_STRATEGY_TTL_MS`]. Call only on
    /// queue-idle transitions, mirroring the job-result GC cadence.
    pub fn gc_tombstones(&mut self, now_ms: i64) {
        self.deleted
            .retain(|_, d| now_ms - d.deleted_ms < DELETED_STRATEGY_TTL_MS);
    }

    /// Evaluate every enabled, non-deleted strategy for this tick and
    /// return the firings. Does not itself enqueue jobs — that's the core
    /// context's job, so the engine stays testable without a queue.
    pub fn evaluate_tick(&mut self, now_ms: i64, now: TimeOfDay, sensors: &SensorTable) -> Vec<FireResult> {
        let mut fired = Vec::new();
        let ids: Vec<String> = self.strategies.keys().cloned().collect();
        for id in ids {
            let Some(strategy) = self.strategies.get(&id) else {
                continue;
            };
            if !strategy.enabled {
                continue;
            }
            if !in_effective_window(strategy, now) {
                continue;
            }
            if let Some(last) = strategy.last_triggered_ms {
                if now_ms - last < MIN_REFIRE_MS {
                    continue;
                }
            }
            if !conditions_pass(strategy, sensors) {
                continue;
            }

            let writes: Vec<(u32, u8, Action)> = strategy
                .actions
                .iter()
                .filter_map(|a| parse_action(a))
                .collect();

            let strategy = self.strategies.get_mut(&id).expect("checked above");
            strategy.last_triggered_ms = Some(now_ms);
            fired.push(FireResult {
                strategy_id: id,
                strategy_name: strategy.name.clone(),
                writes,
            });
        }
        fired
    }
}

fn in_effective_window(strategy: &Strategy, now: TimeOfDay) -> bool {
    let (Some(begin), Some(end)) = (
        strategy.effective_begin.as_deref().and_then(TimeOfDay::parse),
        strategy.effective_end.as_deref().and_then(TimeOfDay::parse),
    ) else {
        return true;
    };
    if begin <= end {
        begin <= now && now <= end
    } else {
        now >= begin || now <= end
    }
}

fn conditions_pass(strategy: &Strategy, sensors: &SensorTable) -> bool {
    if strategy.conditions.is_empty() {
        return true;
    }
    let mut evaluated = 0usize;
    let mut passed = 0usize;
    for condition in &strategy.conditions {
        let Some(entry) = sensors.get(&condition.sensor_id) else {
            continue;
        };
        let Some(value) = entry.value.as_f64() else {
            continue;
        };
        evaluated += 1;
        if evaluate_condition(value, condition.op, condition.threshold) {
            passed += 1;
        }
    }
    if evaluated == 0 {
        return false;
    }
    match strategy.match_type {
        MatchType::All => passed == evaluated,
        MatchType::Any => passed > 0,
    }
}

fn evaluate_condition(value: f64, op: ConditionOp, threshold: f64) -> bool {
    match op {
        ConditionOp::Eq => (value - threshold).abs() < CONDITION_EPSILON,
        ConditionOp::Ne => (value - threshold).abs() >= CONDITION_EPSILON,
        ConditionOp::Gt => value > threshold,
        ConditionOp::Lt => value < threshold,
        ConditionOp::Ge => value >= threshold - CONDITION_EPSILON,
        ConditionOp::Le => value <= threshold + CONDITION_EPSILON,
    }
}

/// `node_<n>_sw<c>`, 1-based channel in the identifier.
pub(crate) fn parse_action(action: &StrategyAction) -> Option<(u32, u8, Action)> {
    let rest = action.identifier.strip_prefix("node_")?;
    let (node_str, sw_str) = rest.split_once("_sw")?;
    let node: u32 = node_str.parse().ok()?;
    let channel_1based: u8 = sw_str.parse().ok()?;
    let channel = channel_1based.checked_sub(1)?;
    let act = match action.value {
        0 => Action::Stop,
        1 => Action::Forward,
        2 => Action::Reverse,
        _ => return None,
    };
    Some((node, channel, act))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorTable;

    fn scene(id: &str, conditions: Vec<Condition>, match_type: MatchType) -> Strategy {
        Strategy {
            id: id.to_string(),
            name: format!("{id}-name"),
            strategy_type: StrategyType::Scene,
            version: 0,
            enabled: true,
            match_type,
            effective_begin: None,
            effective_end: None,
            actions: vec![StrategyAction {
                identifier: "node_3_sw2".to_string(),
                value: 1,
            }],
            conditions,
            last_triggered_ms: None,
        }
    }

    #[test]
    fn create_or_update_defaults_new_strategy_to_version_one() {
        let mut engine = StrategyEngine::new();
        let saved = engine.create_or_update(scene("s1", vec![], MatchType::All));
        assert_eq!(saved.version, 1);
    }

    #[test]
    fn create_or_update_bumps_version_and_ignores_incoming_value() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        let mut updated = scene("s1", vec![], MatchType::All);
        updated.version = 999;
        let saved = engine.create_or_update(updated);
        assert_eq!(saved.version, 2);
    }

    #[test]
    fn create_or_update_preserves_last_triggered_across_updates() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        engine
            .evaluate_tick(1_000, TimeOfDay { hour: 12, minute: 0 }, &SensorTable::new());
        assert!(engine.get("s1").unwrap().last_triggered_ms.is_some());
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        assert_eq!(engine.get("s1").unwrap().last_triggered_ms, Some(1_000));
    }

    #[test]
    fn delete_is_idempotent_and_distinguishes_not_found() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        assert_eq!(engine.delete("s1", 0), DeleteOutcome::Deleted);
        assert_eq!(engine.delete("s1", 0), DeleteOutcome::AlreadyDeleted);
        assert_eq!(engine.delete("never-existed", 0), DeleteOutcome::NotFound);
    }

    #[test]
    fn set_id_fails_when_target_already_exists() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        engine.create_or_update(scene("s2", vec![], MatchType::All));
        assert!(engine.set_id("s1", "s2".to_string()).is_err());
    }

    #[test]
    fn timer_strategy_fires_unconditionally_on_schedule() {
        let mut engine = StrategyEngine::new();
        let mut timer = scene("t1", vec![], MatchType::All);
        timer.strategy_type = StrategyType::Timer;
        engine.create_or_update(timer);
        let fired = engine.evaluate_tick(0, TimeOfDay { hour: 9, minute: 0 }, &SensorTable::new());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].writes, vec![(3, 1, Action::Forward)]);
    }

    #[test]
    fn all_match_requires_every_evaluated_condition_to_pass() {
        let sensors = sensor_table_with(&[("temp", 30.0), ("humidity", 40.0)]);

        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene(
            "s1",
            vec![
                Condition {
                    sensor_id: "temp".into(),
                    op: ConditionOp::Gt,
                    threshold: 20.0,
                },
                Condition {
                    sensor_id: "humidity".into(),
                    op: ConditionOp::Lt,
                    threshold: 35.0,
                },
            ],
            MatchType::All,
        ));
        let fired = engine.evaluate_tick(0, TimeOfDay { hour: 0, minute: 0 }, &sensors);
        assert!(fired.is_empty(), "humidity condition fails so ALL must not fire");
    }

    #[test]
    fn any_match_fires_if_one_evaluated_condition_passes() {
        let sensors = sensor_table_with(&[("temp", 30.0)]);

        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene(
            "s1",
            vec![
                Condition {
                    sensor_id: "temp".into(),
                    op: ConditionOp::Gt,
                    threshold: 20.0,
                },
                Condition {
                    sensor_id: "missing".into(),
                    op: ConditionOp::Gt,
                    threshold: 20.0,
                },
            ],
            MatchType::Any,
        ));
        let fired = engine.evaluate_tick(0, TimeOfDay { hour: 0, minute: 0 }, &sensors);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn missing_sensor_conditions_never_satisfy_all_or_any_alone() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene(
            "s1",
            vec![Condition {
                sensor_id: "missing".into(),
                op: ConditionOp::Gt,
                threshold: 20.0,
            }],
            MatchType::Any,
        ));
        let fired = engine.evaluate_tick(0, TimeOfDay { hour: 0, minute: 0 }, &SensorTable::new());
        assert!(fired.is_empty());
    }

    #[test]
    fn debounce_suppresses_refire_inside_min_refire_window() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("t1", vec![], MatchType::All));
        let first = engine.evaluate_tick(0, TimeOfDay { hour: 0, minute: 0 }, &SensorTable::new());
        assert_eq!(first.len(), 1);
        let second = engine.evaluate_tick(
            MIN_REFIRE_MS - 1,
            TimeOfDay { hour: 0, minute: 0 },
            &SensorTable::new(),
        );
        assert!(second.is_empty());
        let third = engine.evaluate_tick(
            MIN_REFIRE_MS,
            TimeOfDay { hour: 0, minute: 0 },
            &SensorTable::new(),
        );
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn wrap_midnight_window_matches_overnight_hours() {
        let mut strategy = scene("s1", vec![], MatchType::All);
        strategy.effective_begin = Some("22:00".into());
        strategy.effective_end = Some("06:00".into());
        assert!(in_effective_window(&strategy, TimeOfDay { hour: 23, minute: 0 }));
        assert!(in_effective_window(&strategy, TimeOfDay { hour: 2, minute: 0 }));
        assert!(!in_effective_window(&strategy, TimeOfDay { hour: 12, minute: 0 }));
    }

    #[test]
    fn invalid_effective_window_field_means_always_in_window() {
        let mut strategy = scene("s1", vec![], MatchType::All);
        strategy.effective_begin = Some("bogus".into());
        strategy.effective_end = Some("06:00".into());
        assert!(in_effective_window(&strategy, TimeOfDay { hour: 12, minute: 0 }));
    }

    #[test]
    fn ge_and_le_apply_epsilon_tolerance_at_the_boundary() {
        assert!(evaluate_condition(9.95, ConditionOp::Ge, 10.0));
        assert!(!evaluate_condition(9.8, ConditionOp::Ge, 10.0));
        assert!(evaluate_condition(10.05, ConditionOp::Le, 10.0));
        assert!(!evaluate_condition(10.2, ConditionOp::Le, 10.0));
    }

    #[test]
    fn set_enabled_toggles_flag_and_reports_unknown_ids() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        assert!(engine.set_enabled("s1", false));
        assert!(!engine.get("s1").unwrap().enabled);
        assert!(!engine.set_enabled("missing", true));
    }

    #[test]
    fn force_fire_ignores_debounce_and_effective_window() {
        let mut engine = StrategyEngine::new();
        let mut strategy = scene("s1", vec![], MatchType::All);
        strategy.effective_begin = Some("08:00".into());
        strategy.effective_end = Some("09:00".into());
        engine.create_or_update(strategy);
        engine.evaluate_tick(0, TimeOfDay { hour: 8, minute: 30 }, &SensorTable::new());
        assert!(engine
            .evaluate_tick(1, TimeOfDay { hour: 23, minute: 0 }, &SensorTable::new())
            .is_empty());

        let fired = engine.force_fire("s1", 2, &SensorTable::new());
        assert!(fired.is_some(), "manual trigger fires outside the window and debounce");
    }

    #[test]
    fn force_fire_still_honors_disabled_and_conditions() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        engine.set_enabled("s1", false);
        assert!(engine.force_fire("s1", 0, &SensorTable::new()).is_none());

        let sensors = sensor_table_with(&[("temp", 10.0)]);
        engine.set_enabled("s1", true);
        let mut conditional = scene(
            "s2",
            vec![Condition {
                sensor_id: "temp".into(),
                op: ConditionOp::Gt,
                threshold: 20.0,
            }],
            MatchType::All,
        );
        conditional.actions = vec![StrategyAction {
            identifier: "node_3_sw2".into(),
            value: 1,
        }];
        engine.create_or_update(conditional);
        assert!(engine.force_fire("s2", 0, &sensors).is_none());
    }

    #[test]
    fn gc_tombstones_expires_entries_past_ttl() {
        let mut engine = StrategyEngine::new();
        engine.create_or_update(scene("s1", vec![], MatchType::All));
        engine.delete("s1", 0);
        engine.gc_tombstones(DELETED_STRATEGY_TTL_MS - 1);
        assert_eq!(engine.delete("s1", 0), DeleteOutcome::AlreadyDeleted);
        engine.gc_tombstones(DELETED_STRATEGY_TTL_MS + 1);
        assert_eq!(engine.delete("s1", 0), DeleteOutcome::NotFound);
    }
}
