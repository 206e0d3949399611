use crate::config::PushConfig;
use crate::metrics::Metrics;
use rally_storage::Storage;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Out-of-band wake-up delivery. One vendor submission per registered device
/// token; tokens the vendor reports dead are pruned on the way out. The
/// channel never fails its caller: an unconfigured or unreachable vendor
/// just reports "nobody reached".
pub struct PushChannel {
    client: Option<reqwest::Client>,
    endpoint: Option<String>,
    api_key: Option<String>,
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
}

fn vendor_request(token: &str, payload: &Value) -> Value {
    json!({
        "to": token,
        "priority": "high",
        "data": payload,
    })
}

/// Whether a vendor response means the device token is gone for good.
fn token_is_dead(status: u16, body: &str) -> bool {
    if status == 404 || status == 410 {
        return true;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let Some(error) = parsed.get("error").and_then(|v| v.as_str()) else {
        return false;
    };
    matches!(
        error.to_ascii_lowercase().as_str(),
        "invalid" | "invalid_token" | "invalidregistration" | "unregistered" | "notregistered"
    )
}

impl PushChannel {
    pub fn new(config: &PushConfig, storage: Arc<Storage>, metrics: Arc<Metrics>) -> Self {
        let client = if config.is_configured() {
            match reqwest::Client::builder()
                .user_agent("rally-push/1.0")
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
            {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!("push client construction failed: {}", err);
                    None
                }
            }
        } else {
            None
        };
        PushChannel {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            storage,
            metrics,
        }
    }

    /// Fans `payload` out to every device token of the user. Returns true iff
    /// at least one delivery was accepted by the vendor.
    pub async fn send(&self, user_id: &str, payload: &Value) -> bool {
        let (Some(client), Some(endpoint)) = (self.client.as_ref(), self.endpoint.as_deref())
        else {
            debug!(user = user_id, "push vendor not configured; skipping delivery");
            return false;
        };
        let tokens = match self.storage.list_push_tokens(user_id).await {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(user = user_id, "push token lookup failed: {}", err);
                return false;
            }
        };
        if tokens.is_empty() {
            debug!(user = user_id, "no push tokens registered");
            return false;
        }
        let mut delivered = false;
        for record in tokens {
            let mut request = client.post(endpoint).json(&vendor_request(&record.token, payload));
            if let Some(key) = self.api_key.as_deref() {
                request = request.header("authorization", format!("Bearer {key}"));
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    delivered = true;
                    self.metrics.mark_push_delivered();
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    if token_is_dead(status, &body) {
                        if let Err(err) = self
                            .storage
                            .remove_push_token(user_id, &record.token)
                            .await
                        {
                            warn!(user = user_id, "dead token removal failed: {}", err);
                        } else {
                            self.metrics.mark_push_token_pruned();
                            debug!(user = user_id, "pruned dead push token");
                        }
                    } else {
                        warn!(user = user_id, status = status, "push delivery rejected");
                        self.metrics.mark_push_failed();
                    }
                }
                Err(err) => {
                    warn!(user = user_id, "push delivery failed: {}", err);
                    self.metrics.mark_push_failed();
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_request_carries_token_and_data() {
        let body = vendor_request("tok-1", &json!({"type": "challenge:wake-up"}));
        assert_eq!(body["to"], json!("tok-1"));
        assert_eq!(body["data"]["type"], json!("challenge:wake-up"));
    }

    #[test]
    fn dead_token_triage() {
        assert!(token_is_dead(404, ""));
        assert!(token_is_dead(410, "{}"));
        assert!(token_is_dead(400, r#"{"error": "unregistered"}"#));
        assert!(token_is_dead(400, r#"{"error": "NotRegistered"}"#));
        assert!(token_is_dead(400, r#"{"error": "invalid_token"}"#));
        assert!(!token_is_dead(400, r#"{"error": "payload_too_big"}"#));
        assert!(!token_is_dead(500, "internal error"));
        assert!(!token_is_dead(429, r#"{"error": "rate_limited"}"#));
    }
}
