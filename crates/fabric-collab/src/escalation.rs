use serde::Serialize;
use tracing::warn;

/// Payload POSTed to the human escalation webhook.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationPayload {
    pub item_id: String,
    pub title: String,
    pub reason: String,
    pub history: Vec<String>,
    pub escalating_node: String,
}

/// Fire-and-forget HTTP POST to the configured escalation webhook. Failures
/// and non-2xx responses are logged; the caller never retries or blocks on
/// the outcome, per the escalation contract.
pub struct EscalationWebhook {
    url: String,
    client: reqwest::Client,
}

impl EscalationWebhook {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn fire(&self, payload: EscalationPayload) {
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(
                    item_id = %payload.item_id,
                    status = %resp.status(),
                    "escalation webhook returned non-2xx"
                );
            }
            Err(e) => {
                warn!(item_id = %payload.item_id, "escalation webhook request failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn firing_against_an_unreachable_host_does_not_panic() {
        let hook = EscalationWebhook::new("http://127.0.0.1:1".into());
        hook.fire(EscalationPayload {
            item_id: "42".into(),
            title: "t".into(),
            reason: "stuck".into(),
            history: vec!["hello".into()],
            escalating_node: "node-a".into(),
        })
        .await;
    }
}
