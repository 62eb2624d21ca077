// elspeth-core/src/runtime/triggers.rs
// ============================================================================
// Module: ELSPETH Trigger Evaluator
// Description: Count, timeout, and condition triggers for aggregation nodes.
// Purpose: Decide when a draft batch flushes; first trigger to fire wins.
// Dependencies: crate::runtime::condition
// ============================================================================

//! ## Overview
//! Each aggregation node owns one [`TriggerEvaluator`]. Up to three parallel
//! predicates are configured (a member count, a batch age, and a condition
//! expression) and combined with OR logic. Evaluation order is fixed
//! (count, then timeout, then condition); the first predicate to fire wins
//! and is remembered for the audit row. Resetting clears the count and the
//! batch start time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::time::Instant;

use thiserror::Error;

use crate::core::records::TriggerType;
use crate::runtime::condition::Condition;
use crate::runtime::condition::ConditionError;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when configuring a trigger evaluator.
#[derive(Debug, Error)]
pub enum TriggerConfigError {
    /// No predicate was configured.
    #[error("trigger config requires at least one of count, timeout_seconds, condition")]
    Empty,
    /// The condition expression failed to parse.
    #[error(transparent)]
    Condition(#[from] ConditionError),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Trigger configuration for one aggregation node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TriggerConfig {
    /// Member-count threshold.
    #[serde(default)]
    pub count: Option<u32>,
    /// Batch-age threshold in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Condition expression over `batch_count`, `batch_age_seconds`, and
    /// per-aggregation state names.
    #[serde(default)]
    pub condition: Option<String>,
}

// ============================================================================
// SECTION: Evaluator
// ============================================================================

/// Per-aggregation trigger evaluator.
///
/// # Invariants
/// - `which_triggered` reports the predicate observed by the most recent
///   firing `should_trigger` call, or `None` before any firing.
#[derive(Debug)]
pub struct TriggerEvaluator {
    /// Configured count threshold.
    count: Option<u32>,
    /// Configured age threshold in seconds.
    timeout_seconds: Option<f64>,
    /// Compiled condition, when configured.
    condition: Option<Condition>,
    /// Members accepted since the last reset.
    batch_count: u32,
    /// When the first member of the current batch arrived.
    started_at: Option<Instant>,
    /// Per-aggregation state exposed to the condition environment.
    state: BTreeMap<String, f64>,
    /// Predicate that fired most recently.
    fired: Option<TriggerType>,
}

impl TriggerEvaluator {
    /// Builds an evaluator from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerConfigError::Empty`] when no predicate is configured
    /// and [`TriggerConfigError::Condition`] when the condition fails to
    /// parse.
    pub fn new(config: &TriggerConfig) -> Result<Self, TriggerConfigError> {
        if config.count.is_none() && config.timeout_seconds.is_none() && config.condition.is_none()
        {
            return Err(TriggerConfigError::Empty);
        }
        let condition = match &config.condition {
            Some(source) => Some(Condition::parse(source)?),
            None => None,
        };
        Ok(Self {
            count: config.count,
            timeout_seconds: config.timeout_seconds,
            condition,
            batch_count: 0,
            started_at: None,
            state: BTreeMap::new(),
            fired: None,
        })
    }

    /// Records one accepted member.
    pub fn record_accept(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.batch_count += 1;
    }

    /// Publishes a per-aggregation state value into the condition
    /// environment.
    pub fn set_state(&mut self, name: impl Into<String>, value: f64) {
        self.state.insert(name.into(), value);
    }

    /// Returns the current member count.
    #[must_use]
    pub const fn batch_count(&self) -> u32 {
        self.batch_count
    }

    /// Returns seconds since the first accepted member, zero when empty.
    #[must_use]
    pub fn batch_age_seconds(&self) -> f64 {
        self.started_at.map_or(0.0, |start| start.elapsed().as_secs_f64())
    }

    /// Evaluates all configured predicates; the first to fire wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError`] when the condition expression fails to
    /// evaluate; callers record this as a validation error for the
    /// aggregation node rather than crashing the run.
    pub fn should_trigger(&mut self) -> Result<bool, ConditionError> {
        if let Some(threshold) = self.count {
            if self.batch_count >= threshold {
                self.fired = Some(TriggerType::Count);
                return Ok(true);
            }
        }
        if let Some(limit) = self.timeout_seconds {
            if self.started_at.is_some() && self.batch_age_seconds() >= limit {
                self.fired = Some(TriggerType::Timeout);
                return Ok(true);
            }
        }
        if let Some(condition) = &self.condition {
            let mut env = self.state.clone();
            env.insert("batch_count".to_string(), f64::from(self.batch_count));
            env.insert("batch_age_seconds".to_string(), self.batch_age_seconds());
            if condition.evaluate(&env)? {
                self.fired = Some(TriggerType::Condition);
                return Ok(true);
            }
        }
        self.fired = None;
        Ok(false)
    }

    /// Returns which predicate fired most recently.
    #[must_use]
    pub const fn which_triggered(&self) -> Option<TriggerType> {
        self.fired
    }

    /// Clears the count, the batch start time, and the fired marker.
    pub fn reset(&mut self) {
        self.batch_count = 0;
        self.started_at = None;
        self.fired = None;
    }
}
