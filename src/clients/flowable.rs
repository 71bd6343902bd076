//! Flowable REST adapter for the process engine contract.
//!
//! Endpoints used (relative to `engine.base_url`):
//! - `POST runtime/process-instances`: start by definition key + business key
//! - `GET  runtime/process-instances?businessKey=`: active instance lookup
//! - `GET  runtime/tasks?processInstanceBusinessKey=&taskDefinitionKey=`
//! - `POST runtime/tasks/{id}` with `action: complete`
//! - `GET  history/historic-task-instances?finished=true`: finished task lookup
//! - `GET  runtime/executions?processInstanceId=&signalEventSubscriptionName=`
//!   then `PUT runtime/executions/{id}` with `action: signalEventReceived`

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::onboarding::engine::ProcessEngine;
use crate::onboarding::types::Variables;

#[derive(Debug, Serialize)]
struct RestVariable<'a> {
    name: &'a str,
    value: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ProcessInstanceResponse {
    id: String,
    #[serde(default)]
    ended: bool,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct OwnedRestVariable {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HistoricTaskResponse {
    #[serde(default = "Vec::new")]
    variables: Vec<OwnedRestVariable>,
}

fn rest_variables(variables: &Variables) -> Vec<RestVariable<'_>> {
    variables
        .iter()
        .map(|(name, value)| RestVariable { name, value })
        .collect()
}

/// HTTP client for a Flowable REST deployment.
#[derive(Debug, Clone)]
pub struct FlowableClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl FlowableClient {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.timeout(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn execute(&self, operation: &str, builder: RequestBuilder) -> Result<reqwest::Response, EngineError> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify(operation, self.timeout, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(operation = operation, status = %status, "Flowable rejected request");
        Err(EngineError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, EngineError> {
        self.execute(operation, builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| {
                if e.is_decode() {
                    EngineError::Decode(e.to_string())
                } else {
                    classify(operation, self.timeout, e)
                }
            })
    }
}

/// Map a transport error onto the ambiguity taxonomy.
fn classify(operation: &str, timeout: Duration, err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_connect() {
        EngineError::Unreachable(err.to_string())
    } else {
        EngineError::Transport(err.to_string())
    }
}

#[async_trait]
impl ProcessEngine for FlowableClient {
    async fn start_instance(
        &self,
        process_key: &str,
        business_key: &str,
        variables: &Variables,
    ) -> Result<String, EngineError> {
        let body = json!({
            "processDefinitionKey": process_key,
            "businessKey": business_key,
            "variables": rest_variables(variables),
            "returnVariables": false,
        });
        let created: IdResponse = self
            .execute_json(
                "start_instance",
                self.request(Method::POST, "runtime/process-instances").json(&body),
            )
            .await?;
        Ok(created.id)
    }

    async fn find_instance(&self, business_key: &str) -> Result<Option<String>, EngineError> {
        let list: ListResponse<ProcessInstanceResponse> = self
            .execute_json(
                "find_instance",
                self.request(Method::GET, "runtime/process-instances")
                    .query(&[("businessKey", business_key)]),
            )
            .await?;
        Ok(list
            .data
            .into_iter()
            .find(|instance| !instance.ended)
            .map(|instance| instance.id))
    }

    async fn find_pending_task(
        &self,
        business_key: &str,
        task_key: &str,
    ) -> Result<Option<String>, EngineError> {
        let list: ListResponse<IdResponse> = self
            .execute_json(
                "find_pending_task",
                self.request(Method::GET, "runtime/tasks").query(&[
                    ("processInstanceBusinessKey", business_key),
                    ("taskDefinitionKey", task_key),
                ]),
            )
            .await?;
        Ok(list.data.into_iter().next().map(|task| task.id))
    }

    async fn complete_task(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError> {
        let body = json!({
            "action": "complete",
            "variables": rest_variables(variables),
        });
        self.execute(
            "complete_task",
            self.request(Method::POST, &format!("runtime/tasks/{}", task_id))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn find_completed_task(
        &self,
        business_key: &str,
        task_key: &str,
    ) -> Result<Option<Variables>, EngineError> {
        let list: ListResponse<HistoricTaskResponse> = self
            .execute_json(
                "find_completed_task",
                self.request(Method::GET, "history/historic-task-instances").query(&[
                    ("processBusinessKey", business_key),
                    ("taskDefinitionKey", task_key),
                    ("finished", "true"),
                    ("includeProcessVariables", "true"),
                    ("sort", "endTime"),
                    ("order", "desc"),
                ]),
            )
            .await?;
        Ok(list.data.into_iter().next().map(|task| {
            task.variables
                .into_iter()
                .map(|variable| (variable.name, variable.value))
                .collect()
        }))
    }

    async fn signal_instance(
        &self,
        instance_id: &str,
        signal_name: &str,
        variables: &Variables,
    ) -> Result<(), EngineError> {
        let executions: ListResponse<IdResponse> = self
            .execute_json(
                "signal_instance",
                self.request(Method::GET, "runtime/executions").query(&[
                    ("processInstanceId", instance_id),
                    ("signalEventSubscriptionName", signal_name),
                ]),
            )
            .await?;

        if executions.data.is_empty() {
            return Err(EngineError::Rejected {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: format!(
                    "no execution of {} subscribed to {}",
                    instance_id, signal_name
                ),
            });
        }

        let body = json!({
            "action": "signalEventReceived",
            "signalName": signal_name,
            "variables": rest_variables(variables),
        });
        for execution in executions.data {
            self.execute(
                "signal_instance",
                self.request(Method::PUT, &format!("runtime/executions/{}", execution.id))
                    .json(&body),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_variables_shape() {
        let mut vars = Variables::new();
        vars.insert("cafRefNo".to_string(), json!("CAF-1"));
        vars.insert("recordId".to_string(), json!(7));
        let encoded = serde_json::to_value(rest_variables(&vars)).unwrap();
        assert_eq!(
            encoded,
            json!([
                {"name": "cafRefNo", "value": "CAF-1"},
                {"name": "recordId", "value": 7}
            ])
        );
    }

    #[test]
    fn test_instance_list_decodes() {
        let list: ListResponse<ProcessInstanceResponse> = serde_json::from_str(
            r#"{"data":[{"id":"pi-1","ended":true},{"id":"pi-2","businessKey":"CAF-1"}],"total":2}"#,
        )
        .unwrap();
        let active: Vec<_> = list.data.iter().filter(|i| !i.ended).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "pi-2");
    }

    #[test]
    fn test_historic_task_variables_decode() {
        let list: ListResponse<HistoricTaskResponse> = serde_json::from_str(
            r#"{"data":[{"id":"t-1","variables":[{"name":"approved","value":false,"scope":"global"}]},{"id":"t-0"}]}"#,
        )
        .unwrap();
        assert_eq!(list.data[0].variables[0].name, "approved");
        assert_eq!(list.data[0].variables[0].value, json!(false));
        assert!(list.data[1].variables.is_empty());
    }
}
