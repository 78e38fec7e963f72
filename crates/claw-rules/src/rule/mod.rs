//! Rule definitions and their evaluation state.
//!
//! A [`Rule`] is either an [`AlertingRule`] or a [`RecordingRule`]. Code that
//! needs kind-specific behavior matches on the variant; the operations common
//! to both are available directly on [`Rule`].

pub mod alerting;
pub mod recording;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RuleConfig;
use crate::datasource::Querier;
use crate::error::{Result, RuleError};
use crate::hash::RuleKind;
use crate::template::TemplateRenderer;
use crate::types::{Labels, TimeSeries};

pub use alerting::{AlertingRule, AlertingSpec};
pub use recording::{RecordingRule, RecordingSpec};
pub use state::{RuleState, StateEntry};

/// An alerting or recording rule.
#[derive(Debug)]
pub enum Rule {
    /// Produces stateful alerts.
    Alerting(AlertingRule),
    /// Produces derived series.
    Recording(RecordingRule),
}

impl Rule {
    /// Builds a rule from its definition.
    #[must_use]
    pub fn from_config(
        cfg: &RuleConfig,
        group_id: u64,
        group_labels: &Labels,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        match cfg.kind() {
            RuleKind::Alerting => {
                Self::Alerting(AlertingRule::new(cfg, group_id, group_labels, renderer))
            }
            RuleKind::Recording => Self::Recording(RecordingRule::new(cfg, group_id, group_labels)),
        }
    }

    /// Returns the content ID of the rule.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Alerting(r) => r.id(),
            Self::Recording(r) => r.id(),
        }
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Alerting(r) => r.name(),
            Self::Recording(r) => r.name(),
        }
    }

    /// Returns the rule kind.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        match self {
            Self::Alerting(_) => RuleKind::Alerting,
            Self::Recording(_) => RuleKind::Recording,
        }
    }

    /// Returns the evaluation history.
    #[must_use]
    pub const fn state(&self) -> &RuleState {
        match self {
            Self::Alerting(r) => r.state(),
            Self::Recording(r) => r.state(),
        }
    }

    /// Returns the latest evaluation outcome.
    #[must_use]
    pub fn last_state(&self) -> Option<StateEntry> {
        self.state().last()
    }

    /// Patches the definition of this rule with the one of `other`, keeping state.
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRule` if the rules are of different kinds.
    pub fn update_with(&self, other: &Self) -> Result<()> {
        match (self, other) {
            (Self::Alerting(a), Self::Alerting(b)) => {
                a.update_with(b);
                Ok(())
            }
            (Self::Recording(a), Self::Recording(b)) => {
                a.update_with(b);
                Ok(())
            }
            _ => Err(RuleError::InvalidRule {
                reason: format!(
                    "cannot update {} rule {:?} with {} rule {:?}",
                    self.kind(),
                    self.name(),
                    other.kind(),
                    other.name()
                ),
            }),
        }
    }

    /// Evaluates the rule over a historical range.
    ///
    /// # Errors
    ///
    /// Returns an error if the range query or series mapping fails.
    pub async fn exec_range(
        &self,
        querier: &dyn Querier,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        eval_interval: Duration,
    ) -> Result<Vec<TimeSeries>> {
        match self {
            Self::Alerting(r) => r.exec_range(querier, start, end, eval_interval).await,
            Self::Recording(r) => r.exec_range(querier, start, end).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::DefaultRenderer;

    fn renderer() -> Arc<dyn TemplateRenderer> {
        Arc::new(DefaultRenderer::new())
    }

    #[test]
    fn from_config_picks_kind() {
        let a = Rule::from_config(&RuleConfig::alerting("a", "up"), 1, &Labels::new(), renderer());
        let r = Rule::from_config(&RuleConfig::recording("r", "up"), 1, &Labels::new(), renderer());
        assert_eq!(a.kind(), RuleKind::Alerting);
        assert_eq!(r.kind(), RuleKind::Recording);
        assert_eq!(a.name(), "a");
        assert_eq!(a.id(), RuleConfig::alerting("a", "up").id());
    }

    #[test]
    fn update_with_rejects_kind_change() {
        let a = Rule::from_config(&RuleConfig::alerting("a", "up"), 1, &Labels::new(), renderer());
        let r = Rule::from_config(&RuleConfig::recording("a", "up"), 1, &Labels::new(), renderer());
        assert!(a.update_with(&r).is_err());
        assert!(a.update_with(&a).is_ok());
    }

    #[test]
    fn last_state_starts_empty() {
        let r = Rule::from_config(&RuleConfig::recording("r", "up"), 1, &Labels::new(), renderer());
        assert!(r.last_state().is_none());
    }
}
