//! Event type → destination queue

pub const USER_QUEUE: &str = "lendtech.user.events";
pub const ORGANIZATION_QUEUE: &str = "lendtech.organization.events";
pub const FINANCIAL_QUEUE: &str = "lendtech.financial.events";
pub const DEFAULT_QUEUE: &str = "lendtech.default.events";

/// Ordered prefix rules; the first matching prefix wins
#[derive(Debug, Clone)]
pub struct QueueRouter {
    rules: Vec<(String, String)>,
    fallback: String,
}

impl QueueRouter {
    /// A router with no rules: every event goes to `fallback`
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            fallback: fallback.into(),
        }
    }

    pub fn with_rule(mut self, prefix: impl Into<String>, queue: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), queue.into()));
        self
    }

    pub fn route(&self, event_type: &str) -> &str {
        self.rules
            .iter()
            .find(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .map(|(_, queue)| queue.as_str())
            .unwrap_or(&self.fallback)
    }

    /// Every queue this router can produce, fallback last, without duplicates
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for queue in self
            .rules
            .iter()
            .map(|(_, q)| q)
            .chain(std::iter::once(&self.fallback))
        {
            if !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
            .with_rule("User", USER_QUEUE)
            .with_rule("Role", USER_QUEUE)
            .with_rule("Organization", ORGANIZATION_QUEUE)
            .with_rule("Financial", FINANCIAL_QUEUE)
            .with_rule("Loan", FINANCIAL_QUEUE)
            .with_rule("Payment", FINANCIAL_QUEUE)
    }
}
