use crate::api::API_KEY_HEADER;
use crate::config::{HealthConfig, UpstreamConfig};
use crate::db::{DbHandle, HealthObservation, HealthSource};
use crate::error::CastorError;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Background health prober: exercises every (credential, model) pair whose
/// re-test deadline has elapsed and feeds the observed status back into the
/// store. A transport failure leaves the record untouched so the pair is
/// retried on the next tick.
pub struct Prober {
    db: DbHandle,
    client: reqwest::Client,
    url_template: String,
    models: Vec<String>,
}

impl Prober {
    pub fn new(db: DbHandle, health_cfg: &HealthConfig, upstream_cfg: &UpstreamConfig) -> Self {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(health_cfg.probe_timeout());

        if let Some(proxy_url) = &upstream_cfg.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .expect("invalid proxy url for probe client");
            builder = builder.proxy(proxy);
        }

        Self {
            db,
            client: builder.build().expect("failed to build probe client"),
            url_template: health_cfg.probe_url_template.clone(),
            models: upstream_cfg.models.clone(),
        }
    }

    pub fn spawn(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "probe pass failed");
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<(), CastorError> {
        let credentials = self.db.list_credentials().await?;
        if credentials.is_empty() {
            debug!("no credentials to probe");
            return Ok(());
        }

        info!(count = credentials.len(), "starting probe pass");

        for credential in credentials {
            for model in &self.models {
                let due = match self.db.get_health(credential.id, model).await? {
                    None => true,
                    Some(record) => record.next_test_time <= Utc::now(),
                };
                if !due {
                    continue;
                }

                let Some(status) = self.probe(&credential.key_value, model).await else {
                    continue;
                };

                let observation = HealthObservation {
                    key_id: credential.id,
                    model: model.clone(),
                    status,
                    source: HealthSource::Prober,
                };
                if let Err(e) = self.db.record_health(observation).await {
                    warn!(key_id = credential.id, model = %model, error = %e, "failed to record probe result");
                }
            }
        }

        Ok(())
    }

    /// One synthetic upstream call. Returns the HTTP status, or None on a
    /// transport failure (timeout, connect error).
    async fn probe(&self, key: &str, model: &str) -> Option<u16> {
        let url = self.url_template.replace("{model_name}", model);
        let payload = json!({ "contents": [{ "parts": [{ "text": "Hello, world!" }] }] });

        match self
            .client
            .post(url)
            .header(API_KEY_HEADER, key)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                warn!(model, error = %e, "probe transport failure");
                None
            }
        }
    }
}
