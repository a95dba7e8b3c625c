//! Sibling weights for drag-and-drop reordering.
//!
//! Children of a container are listed by descending weight. A moved item gets
//! a weight inside the gap it was dropped into, so no sibling is renumbered.
//! Weights at or above the pinned threshold sort ahead of every unpinned item;
//! fresh weights are millisecond timestamps, offset by the threshold when
//! pinned.

use crate::settings::LiveDataSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropPosition {
    Before,
    After,
    Into,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightRules {
    pub pinned_weight: f64,
    pub increment: f64,
}

impl Default for WeightRules {
    fn default() -> Self {
        Self::from(&LiveDataSettings::default())
    }
}

impl From<&LiveDataSettings> for WeightRules {
    fn from(settings: &LiveDataSettings) -> Self {
        Self {
            pinned_weight: settings.pinned_weight,
            increment: settings.weight_increment,
        }
    }
}

impl WeightRules {
    pub fn is_pinned(&self, weight: f64) -> bool {
        weight >= self.pinned_weight
    }

    fn fresh_top(&self, now_millis: i64) -> f64 {
        now_millis as f64
    }

    fn fresh_pinned_top(&self, now_millis: i64) -> f64 {
        self.pinned_weight + now_millis as f64
    }
}

/// `previous` is the sibling listed directly above `over`, `next` the one directly below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightRequest {
    pub over: f64,
    pub previous: Option<f64>,
    pub next: Option<f64>,
    pub position: DropPosition,
}

pub fn compute_weight(request: &WeightRequest, rules: &WeightRules, now_millis: i64) -> f64 {
    let (upper, lower) = match request.position {
        DropPosition::Into => return rules.fresh_top(now_millis),
        DropPosition::Before => (request.previous, Some(request.over)),
        DropPosition::After => (Some(request.over), request.next),
    };

    match (upper, lower) {
        (Some(upper), Some(lower)) => {
            if rules.is_pinned(upper) != rules.is_pinned(lower) {
                match request.position {
                    DropPosition::Before => rules.fresh_pinned_top(now_millis),
                    _ => rules.fresh_top(now_millis),
                }
            } else {
                (upper + lower) / 2.0
            }
        }
        (None, Some(head)) => {
            if rules.is_pinned(head) {
                rules.fresh_pinned_top(now_millis).max(head + rules.increment)
            } else {
                head + rules.increment
            }
        }
        (Some(tail), None) => {
            let weight = tail - rules.increment;
            if rules.is_pinned(tail) {
                weight.max(rules.pinned_weight)
            } else {
                weight
            }
        }
        (None, None) => rules.fresh_top(now_millis),
    }
}

pub fn compute_weight_now(request: &WeightRequest, rules: &WeightRules) -> f64 {
    compute_weight(request, rules, chrono::Utc::now().timestamp_millis())
}
