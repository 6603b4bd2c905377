use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::CompletionOptions;

/// A budget check failure. Each variant carries the breached counter and
/// its cap so the caller can report exactly what ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetViolation {
    DepthExceeded { depth: u32, max_depth: u32 },
    TokenExhausted { used: u64, budget: u64 },
    CostExhausted { used: f64, budget: f64 },
    ToolExhausted { used: u32, budget: u32 },
    DeadlineReached { elapsed_ms: u64, timeout_ms: u64 },
}

impl std::fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DepthExceeded { depth, max_depth } => {
                write!(f, "depth exceeded ({depth}/{max_depth})")
            }
            Self::TokenExhausted { used, budget } => {
                write!(f, "token budget exhausted ({used}/{budget})")
            }
            Self::CostExhausted { used, budget } => {
                write!(f, "cost budget exhausted (${used:.4}/${budget:.4})")
            }
            Self::ToolExhausted { used, budget } => {
                write!(f, "tool-call budget exhausted ({used}/{budget})")
            }
            Self::DeadlineReached {
                elapsed_ms,
                timeout_ms,
            } => {
                write!(f, "deadline reached ({elapsed_ms}ms/{timeout_ms}ms)")
            }
        }
    }
}

/// Per-completion accountant of tokens, cost, tool calls, wallclock, and
/// depth. Consumed counters only grow; remaining amounts are derived.
///
/// One ledger belongs to one completion. Sub-completions get a derived
/// ledger via [`BudgetLedger::child`] and charge their consumption back to
/// the parent with [`BudgetLedger::absorb`]. The deadline `Instant` is
/// shared by the whole tree: wallclock is a single global budget.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    token_budget: u64,
    cost_budget: Option<f64>,
    tool_budget: u32,
    max_depth: u32,
    depth: u32,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
    tokens_used: u64,
    cost_used: f64,
    tool_calls_used: u32,
}

impl BudgetLedger {
    /// Root ledger for a top-level completion at depth 0.
    pub fn new(options: &CompletionOptions) -> Self {
        let timeout = Duration::from_secs(options.timeout_seconds);
        let started = Instant::now();
        Self {
            token_budget: options.token_budget,
            cost_budget: options.cost_budget,
            tool_budget: options.tool_budget,
            max_depth: options.max_depth,
            depth: 0,
            started,
            deadline: started + timeout,
            timeout,
            tokens_used: 0,
            cost_used: 0.0,
            tool_calls_used: 0,
        }
    }

    /// Derive a sub-completion ledger: its own token/cost/tool caps, one
    /// level deeper, sharing the parent's deadline.
    pub fn child(&self, token_budget: u64, cost_budget: Option<f64>, tool_budget: u32) -> Self {
        Self {
            token_budget,
            cost_budget,
            tool_budget,
            max_depth: self.max_depth,
            depth: self.depth + 1,
            started: self.started,
            deadline: self.deadline,
            timeout: self.timeout,
            tokens_used: 0,
            cost_used: 0.0,
            tool_calls_used: 0,
        }
    }

    /// Charge one LLM call's usage against the ledger.
    pub fn charge(&mut self, input_tokens: u64, output_tokens: u64, cost: Option<f64>) {
        self.tokens_used = self
            .tokens_used
            .saturating_add(input_tokens)
            .saturating_add(output_tokens);
        if let Some(c) = cost {
            self.cost_used += c;
        }
    }

    /// Charge one tool invocation.
    pub fn charge_tool_call(&mut self) {
        self.tool_calls_used = self.tool_calls_used.saturating_add(1);
    }

    /// Fold a finished sub-completion's consumption back into this ledger.
    pub fn absorb(&mut self, child: &BudgetLedger) {
        self.tokens_used = self.tokens_used.saturating_add(child.tokens_used);
        self.cost_used += child.cost_used;
        self.tool_calls_used = self.tool_calls_used.saturating_add(child.tool_calls_used);
    }

    /// Pre-call check: verify every budget before the next LLM call.
    ///
    /// Checks are pre-call by design, so a completion can overshoot any cap
    /// by at most one call's consumption.
    pub fn check(&self) -> Result<(), BudgetViolation> {
        if self.depth > self.max_depth {
            return Err(BudgetViolation::DepthExceeded {
                depth: self.depth,
                max_depth: self.max_depth,
            });
        }
        if self.tokens_used >= self.token_budget {
            return Err(BudgetViolation::TokenExhausted {
                used: self.tokens_used,
                budget: self.token_budget,
            });
        }
        if let Some(budget) = self.cost_budget
            && self.cost_used >= budget
        {
            return Err(BudgetViolation::CostExhausted {
                used: self.cost_used,
                budget,
            });
        }
        if self.tool_calls_used >= self.tool_budget {
            return Err(BudgetViolation::ToolExhausted {
                used: self.tool_calls_used,
                budget: self.tool_budget,
            });
        }
        if Instant::now() >= self.deadline {
            return Err(BudgetViolation::DeadlineReached {
                elapsed_ms: self.started.elapsed().as_millis() as u64,
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    pub fn tool_calls_used(&self) -> u32 {
        self.tool_calls_used
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.token_budget.saturating_sub(self.tokens_used)
    }

    pub fn remaining_cost(&self) -> Option<f64> {
        self.cost_budget.map(|b| (b - self.cost_used).max(0.0))
    }

    pub fn remaining_tool_calls(&self) -> u32 {
        self.tool_budget.saturating_sub(self.tool_calls_used)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CompletionOptions {
        CompletionOptions {
            token_budget: 1000,
            cost_budget: Some(1.0),
            tool_budget: 3,
            max_depth: 2,
            timeout_seconds: 60,
            ..Default::default()
        }
    }

    #[test]
    fn fresh_ledger_passes_check() {
        let ledger = BudgetLedger::new(&options());
        assert!(ledger.check().is_ok());
        assert_eq!(ledger.remaining_tokens(), 1000);
        assert_eq!(ledger.remaining_tool_calls(), 3);
    }

    #[test]
    fn token_exhaustion_after_two_charges() {
        let mut ledger = BudgetLedger::new(&options());
        ledger.charge(300, 300, None);
        assert!(ledger.check().is_ok());
        ledger.charge(300, 300, None);
        assert_eq!(ledger.tokens_used(), 1200);
        assert_eq!(
            ledger.check(),
            Err(BudgetViolation::TokenExhausted {
                used: 1200,
                budget: 1000
            })
        );
    }

    #[test]
    fn cost_exhaustion() {
        let mut ledger = BudgetLedger::new(&options());
        ledger.charge(10, 10, Some(1.5));
        assert!(matches!(
            ledger.check(),
            Err(BudgetViolation::CostExhausted { .. })
        ));
    }

    #[test]
    fn no_cost_budget_means_no_cost_violation() {
        let mut opts = options();
        opts.cost_budget = None;
        let mut ledger = BudgetLedger::new(&opts);
        ledger.charge(10, 10, Some(99.0));
        assert!(ledger.check().is_ok());
    }

    #[test]
    fn tool_exhaustion() {
        let mut ledger = BudgetLedger::new(&options());
        for _ in 0..3 {
            ledger.charge_tool_call();
        }
        assert_eq!(
            ledger.check(),
            Err(BudgetViolation::ToolExhausted { used: 3, budget: 3 })
        );
    }

    #[test]
    fn child_shares_deadline_and_increments_depth() {
        let ledger = BudgetLedger::new(&options());
        let child = ledger.child(500, None, 2);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.deadline(), ledger.deadline());
        assert_eq!(child.remaining_tokens(), 500);
    }

    #[test]
    fn depth_exceeded_past_max() {
        let ledger = BudgetLedger::new(&options());
        let child = ledger.child(500, None, 2);
        let grandchild = child.child(250, None, 1);
        // depth 2 == max_depth 2 still passes; depth 3 does not
        assert!(grandchild.check().is_ok());
        let great = grandchild.child(100, None, 1);
        assert_eq!(
            great.check(),
            Err(BudgetViolation::DepthExceeded {
                depth: 3,
                max_depth: 2
            })
        );
    }

    #[test]
    fn absorb_folds_child_consumption_into_parent() {
        let mut parent = BudgetLedger::new(&options());
        let mut child = parent.child(500, None, 2);
        child.charge(100, 50, Some(0.02));
        child.charge_tool_call();
        parent.absorb(&child);
        assert_eq!(parent.tokens_used(), 150);
        assert_eq!(parent.tool_calls_used(), 1);
        assert!((parent.cost_used() - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn deadline_reached_with_zero_timeout() {
        let mut opts = options();
        opts.timeout_seconds = 0;
        let ledger = BudgetLedger::new(&opts);
        assert!(matches!(
            ledger.check(),
            Err(BudgetViolation::DeadlineReached { .. })
        ));
    }

    #[test]
    fn violation_display() {
        let v = BudgetViolation::TokenExhausted {
            used: 1200,
            budget: 1000,
        };
        assert_eq!(v.to_string(), "token budget exhausted (1200/1000)");
        let v = BudgetViolation::DepthExceeded {
            depth: 3,
            max_depth: 2,
        };
        assert_eq!(v.to_string(), "depth exceeded (3/2)");
    }

    #[test]
    fn violation_serializes_with_kind_tag() {
        let v = BudgetViolation::ToolExhausted { used: 5, budget: 5 };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "tool_exhausted");
        assert_eq!(json["used"], 5);
    }
}
