use serde::Deserialize;

/// Defaults applied to newly created webhooks.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhooksConfig {
    /// Minimum spacing between delivery attempts, milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Delivery attempts before a webhook is deactivated.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Size of the per-webhook run ring.
    #[serde(default = "default_runs_size")]
    pub runs_size: usize,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_retries: default_max_retries(),
            runs_size: default_runs_size(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_runs_size() -> usize {
    50
}
