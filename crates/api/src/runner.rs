//! Webhook delivery runner.
//!
//! Subscribes to the notifications bus and POSTs change notifications to
//! the registered webhooks of the affected user. Deliveries are retried
//! with at-least `min_interval_ms` spacing; a webhook that exhausts its
//! retry budget is deactivated until an update re-activates it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use trove_core::{unix_now, Username, Webhook, WebhookRun, WebhookState};

use crate::bus::Topic;
use crate::services::Services;

/// Spawn the runner task. It lives until the bus is dropped.
pub fn spawn_webhook_runner(services: Arc<Services>) -> tokio::task::JoinHandle<()> {
    let mut rx = services.bus.subscribe();
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            let notification = match rx.recv().await {
                Ok(n) => n,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "webhook runner lagged behind the bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let relevant = matches!(
                notification.topic,
                Topic::EventsChanged | Topic::StreamsChanged | Topic::AccessesChanged
            );
            let Some(username) = notification.username else {
                continue;
            };
            if !relevant {
                continue;
            }
            deliver_for_user(&services, &client, &username, notification.topic).await;
        }
    })
}

async fn deliver_for_user(
    services: &Services,
    client: &reqwest::Client,
    username: &Username,
    topic: Topic,
) {
    let hooks = match services.storage.webhooks(username).await {
        Ok(hooks) => hooks,
        Err(e) => {
            warn!(user = %username, error = %e, "webhook lookup failed");
            return;
        }
    };
    for hook in hooks {
        if hook.state != WebhookState::Active {
            continue;
        }
        let updated = deliver_one(services, client, hook, topic).await;
        if let Err(e) = services.storage.webhook_update(username, &updated).await {
            warn!(user = %username, hook = %updated.id, error = %e, "webhook state update failed");
        }
    }
}

/// Deliver one notification to one webhook, retrying within the hook's
/// budget. Returns the webhook with updated counters and state.
async fn deliver_one(
    services: &Services,
    client: &reqwest::Client,
    mut hook: Webhook,
    topic: Topic,
) -> Webhook {
    let body = json!({
        "messages": [topic],
        "meta": {
            "apiVersion": services.settings.api_version,
            "serverTime": unix_now(),
        }
    });
    let spacing = Duration::from_millis(hook.min_interval_ms.max(1));

    loop {
        let status = match client.post(&hook.url).json(&body).send().await {
            Ok(response) => response.status().as_u16(),
            Err(e) => {
                debug!(hook = %hook.id, error = %e, "webhook delivery failed");
                0
            }
        };
        hook.record_run(WebhookRun {
            status: if status == 0 { 503 } else { status },
            timestamp: unix_now(),
        });

        if (200..300).contains(&status) {
            hook.current_retries = 0;
            return hook;
        }

        hook.current_retries += 1;
        if hook.current_retries > hook.max_retries {
            warn!(hook = %hook.id, "webhook retries exhausted, deactivating");
            hook.state = WebhookState::Inactive;
            return hook;
        }
        tokio::time::sleep(spacing).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::{AccessId, Tracking};

    fn hook(url: &str, max_retries: u32) -> Webhook {
        Webhook {
            id: "w1".to_owned(),
            access_id: AccessId::new("a1"),
            url: url.to_owned(),
            state: WebhookState::Active,
            run_count: 0,
            fail_count: 0,
            runs: Vec::new(),
            runs_size: 10,
            current_retries: 0,
            max_retries,
            min_interval_ms: 1,
            last_run: None,
            tracking: Tracking::init(1.0, &AccessId::new("a1")),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_deactivates_after_retries() {
        let (services, _) = crate::testing::services_with_user().await;
        let client = reqwest::Client::new();
        // A port nothing listens on.
        let hook = hook("http://127.0.0.1:1/hook", 2);

        let done = deliver_one(&services, &client, hook, Topic::EventsChanged).await;
        assert_eq!(done.state, WebhookState::Inactive);
        assert_eq!(done.run_count, 3); // initial attempt + 2 retries
        assert_eq!(done.fail_count, 3);
    }
}
