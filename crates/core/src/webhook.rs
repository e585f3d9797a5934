use serde::{Deserialize, Serialize};

use crate::types::{AccessId, Tracking};

/// Lifecycle state of a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookState {
    Active,
    /// Deactivated after exhausting its retries; reactivated by an update.
    Inactive,
}

/// Outcome of one delivery attempt, kept in a bounded ring on the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRun {
    pub status: u16,
    pub timestamp: f64,
}

/// An outbound change-notification target registered by an access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    /// The access that created this webhook; scopes visibility and deletion.
    pub access_id: AccessId,
    pub url: String,
    pub state: WebhookState,
    pub run_count: u64,
    pub fail_count: u64,
    /// Most recent runs, newest first, bounded by `runs_size`.
    #[serde(default)]
    pub runs: Vec<WebhookRun>,
    pub runs_size: usize,
    pub current_retries: u32,
    pub max_retries: u32,
    pub min_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<WebhookRun>,
    #[serde(flatten)]
    pub tracking: Tracking,
}

impl Webhook {
    /// Record a delivery attempt, updating counters and the bounded ring.
    pub fn record_run(&mut self, run: WebhookRun) {
        self.run_count += 1;
        if run.status >= 400 {
            self.fail_count += 1;
        }
        self.last_run = Some(run.clone());
        self.runs.insert(0, run);
        self.runs.truncate(self.runs_size);
    }
}
