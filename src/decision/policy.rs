//! Stopping policy as an ordered rule table.
//!
//! The first rule that fires decides. Evaluation is a pure function of the
//! [`PolicyInput`], so the same inputs always give the same action.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::Verdict;

/// What the engine does with an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Keep running.
    Continue,
    /// Conclude with a winner.
    StopEfficacy {
        /// The winning variant
        variant_id: String,
    },
    /// Conclude: no variant can reach significance.
    StopFutility,
    /// Conclude: out of time without significance.
    StopInconclusive,
}

impl Action {
    /// Whether the action concludes the experiment.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        !matches!(self, Self::Continue)
    }

    /// Winning variant of an efficacy stop.
    #[must_use]
    pub fn winner(&self) -> Option<&str> {
        match self {
            Self::StopEfficacy { variant_id } => Some(variant_id),
            _ => None,
        }
    }
}

/// Everything the policy looks at.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Smallest per-arm participant count
    pub min_participants: u64,
    /// Required per-arm participants
    pub min_sample_size: u64,
    /// Time since the experiment started
    pub runtime: Duration,
    /// Required runtime
    pub min_runtime: Duration,
    /// Runtime limit
    pub max_runtime: Duration,
    /// Verdict of the analysis, `None` if it could not run
    pub verdict: Option<&'a Verdict>,
    /// Why the analysis could not run
    pub analysis_error: Option<&'a str>,
}

impl PolicyInput<'_> {
    fn over_time(&self) -> bool {
        self.runtime > self.max_runtime
    }
}

struct Rule {
    name: &'static str,
    fires: fn(&PolicyInput<'_>) -> Option<(Action, String)>,
}

const POLICY: [Rule; 5] = [
    Rule {
        name: "minimum_sample_and_runtime",
        fires: gate,
    },
    Rule {
        name: "efficacy",
        fires: efficacy,
    },
    Rule {
        name: "futility",
        fires: futility,
    },
    Rule {
        name: "max_runtime",
        fires: max_runtime,
    },
    Rule {
        name: "otherwise",
        fires: otherwise,
    },
];

fn gate(input: &PolicyInput<'_>) -> Option<(Action, String)> {
    let short = input.min_participants < input.min_sample_size || input.runtime < input.min_runtime;
    (short && !input.over_time()).then(|| {
        (
            Action::Continue,
            format!(
                "collecting data: {} of {} participants per arm, runtime {}s of {}s",
                input.min_participants,
                input.min_sample_size,
                input.runtime.as_secs(),
                input.min_runtime.as_secs()
            ),
        )
    })
}

fn efficacy(input: &PolicyInput<'_>) -> Option<(Action, String)> {
    match input.verdict {
        Some(Verdict::StopEfficacy { variant_id }) => Some((
            Action::StopEfficacy {
                variant_id: variant_id.clone(),
            },
            format!("variant '{variant_id}' crossed the efficacy boundary"),
        )),
        _ => None,
    }
}

fn futility(input: &PolicyInput<'_>) -> Option<(Action, String)> {
    matches!(input.verdict, Some(Verdict::StopFutility)).then(|| {
        (
            Action::StopFutility,
            "every variant crossed the futility boundary".to_string(),
        )
    })
}

fn max_runtime(input: &PolicyInput<'_>) -> Option<(Action, String)> {
    input.over_time().then(|| {
        (
            Action::StopInconclusive,
            format!(
                "maximum runtime of {}s exceeded without significance",
                input.max_runtime.as_secs()
            ),
        )
    })
}

fn otherwise(input: &PolicyInput<'_>) -> Option<(Action, String)> {
    let reason = input.analysis_error.map_or_else(
        || "no boundary crossed".to_string(),
        |e| format!("analysis unavailable: {e}"),
    );
    Some((Action::Continue, reason))
}

/// Evaluate the table; returns the action, the rule name and a reason.
#[must_use]
pub fn evaluate_policy(input: &PolicyInput<'_>) -> (Action, &'static str, String) {
    POLICY
        .iter()
        .find_map(|rule| (rule.fires)(input).map(|(action, reason)| (action, rule.name, reason)))
        .unwrap_or_else(|| (Action::Continue, "otherwise", String::new()))
}
