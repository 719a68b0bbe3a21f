//! HTTP client of the device provisioning service.

use async_trait::async_trait;
use fleetsim_error::{provision::ProvisionError, ProvisionResult};
use fleetsim_sdk::{OperationStatus, RegistrationApi, RegistrationRequest, RegistrationState};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DPS_API_VERSION: &str = "2019-03-31";

/// Used when an in-progress answer carries no usable `Retry-After` header
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    operation_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationStateBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationStateBody {
    #[serde(default)]
    assigned_hub: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone)]
pub struct DpsClient {
    http: Client,
    timeout: Duration,
}

impl DpsClient {
    /// `timeout` bounds each individual HTTP call.
    pub fn new(timeout: Duration) -> ProvisionResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::Network(e.to_string()))?;
        Ok(Self { http, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn base(request: &RegistrationRequest) -> String {
        format!(
            "https://{}/{}/registrations/{}",
            request.endpoint, request.id_scope, request.registration_id
        )
    }

    async fn parse(response: Response) -> ProvisionResult<(StatusCode, Option<Duration>, OperationResponse)> {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Request {
                status: status.as_u16(),
                reason,
            });
        }
        let body = response
            .json::<OperationResponse>()
            .await
            .map_err(|e| ProvisionError::Protocol(e.to_string()))?;
        Ok((status, retry_after, body))
    }
}

fn network(e: reqwest::Error) -> ProvisionError {
    ProvisionError::Network(e.to_string())
}

/// Reads `Retry-After` as whole seconds.
fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify(status: StatusCode, retry_after: Option<Duration>, body: OperationResponse) -> OperationStatus {
    if status == StatusCode::ACCEPTED {
        return OperationStatus::InProgress {
            retry_after: retry_after.or(Some(DEFAULT_RETRY_AFTER)),
        };
    }
    match body.registration_state {
        Some(state) if state.status.eq_ignore_ascii_case("assigned") => {
            OperationStatus::Assigned(RegistrationState {
                assigned_hub: state.assigned_hub,
                device_id: state.device_id,
                status: state.status,
            })
        }
        Some(state) => OperationStatus::Failed {
            status: state.status,
        },
        None if body.status.eq_ignore_ascii_case("assigning") => OperationStatus::InProgress {
            retry_after: retry_after.or(Some(DEFAULT_RETRY_AFTER)),
        },
        None => OperationStatus::Failed {
            status: body.status,
        },
    }
}

#[async_trait]
impl RegistrationApi for DpsClient {
    #[instrument(skip_all, fields(registration_id = %request.registration_id))]
    async fn register(&self, request: &RegistrationRequest) -> ProvisionResult<String> {
        let url = format!("{}/register?api-version={DPS_API_VERSION}", Self::base(request));
        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, &request.sas_token)
            .json(&json!({
                "registrationId": request.registration_id,
                "payload": { "modelId": request.model_id },
            }))
            .send()
            .await
            .map_err(network)?;
        let (_, _, body) = Self::parse(response).await?;
        debug!(operation_id = %body.operation_id, status = %body.status, "registration submitted");
        Ok(body.operation_id)
    }

    async fn operation_status(
        &self,
        request: &RegistrationRequest,
        operation_id: &str,
    ) -> ProvisionResult<OperationStatus> {
        let url = format!(
            "{}/operations/{operation_id}?api-version={DPS_API_VERSION}",
            Self::base(request)
        );
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, &request.sas_token)
            .send()
            .await
            .map_err(network)?;
        let (status, retry_after, body) = Self::parse(response).await?;
        Ok(classify(status, retry_after, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(raw: &str) -> OperationResponse {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_in_progress_defaults_retry_after() {
        let status = classify(
            StatusCode::ACCEPTED,
            None,
            body(r#"{"operationId":"op","status":"assigning"}"#),
        );
        assert_eq!(
            status,
            OperationStatus::InProgress {
                retry_after: Some(DEFAULT_RETRY_AFTER)
            }
        );
    }

    #[test]
    fn test_assigned() {
        let status = classify(
            StatusCode::OK,
            None,
            body(
                r#"{"operationId":"op","status":"assigned","registrationState":
                    {"assignedHub":"hub1.azure-devices.net","deviceId":"d1","status":"assigned"}}"#,
            ),
        );
        match status {
            OperationStatus::Assigned(state) => {
                assert_eq!(state.assigned_hub, "hub1.azure-devices.net");
                assert_eq!(state.device_id, "d1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed() {
        let status = classify(
            StatusCode::OK,
            None,
            body(r#"{"operationId":"op","status":"failed","registrationState":{"status":"disabled"}}"#),
        );
        assert_eq!(status, OperationStatus::Failed { status: "disabled".into() });
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(5)));
        headers.insert(header::RETRY_AFTER, header::HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
