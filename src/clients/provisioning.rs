//! Identity provisioning backend: `POST {base}/imsi/allocate`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProvisionerConfig;
use crate::error::ProvisionError;
use crate::onboarding::provisioner::IdentityProvisioner;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest<'a> {
    plan_code: &'a str,
    caf_ref_no: &'a str,
}

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    #[serde(default)]
    imsi: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpIdentityProvisioner {
    client: Client,
    base_url: String,
    timeout_ms: u64,
}

impl HttpIdentityProvisioner {
    pub fn new(config: &ProvisionerConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
        })
    }
}

#[async_trait]
impl IdentityProvisioner for HttpIdentityProvisioner {
    async fn provision(&self, plan_code: &str, business_ref: &str) -> Result<String, ProvisionError> {
        let response = self
            .client
            .post(format!("{}/imsi/allocate", self.base_url))
            .json(&AllocateRequest {
                plan_code,
                caf_ref_no: business_ref,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProvisionError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    ProvisionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: AllocateResponse = response
            .json()
            .await
            .map_err(|e| ProvisionError::Transport(e.to_string()))?;
        body.imsi
            .filter(|imsi| !imsi.trim().is_empty())
            .ok_or(ProvisionError::Empty)
    }
}
