//! Request dispatch
//!
//! The director speaks single-shot JSON frames: one request object on
//! stdin, one response object on stdout. Failures never surface as a
//! non-zero exit or a broken frame; every error becomes a structured
//! `error` member with a stable type name and a retryability hint.

use crate::error::{CpiError, Result};
use crate::orchestrator::VmOrchestrator;
use crate::props::{DiskProps, VmSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct CpiRequest {
    pub method: String,

    #[serde(default)]
    pub arguments: Vec<Value>,

    /// Director-supplied call context; carried for logging, never
    /// interpreted.
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Serialize)]
pub struct CpiResponse {
    pub result: Value,
    pub error: Option<ErrorFrame>,
    pub log: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub ok_to_retry: bool,
}

impl CpiResponse {
    fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
            log: String::new(),
        }
    }

    fn fail(err: &CpiError) -> Self {
        Self {
            result: Value::Null,
            error: Some(ErrorFrame {
                kind: err.type_name().to_string(),
                message: err.to_string(),
                ok_to_retry: err.ok_to_retry(),
            }),
            log: String::new(),
        }
    }
}

pub struct Dispatcher {
    orchestrator: VmOrchestrator,
}

impl Dispatcher {
    pub fn new(orchestrator: VmOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Decode one raw frame and handle it. Undecodable input still yields a
    /// well-formed error response.
    pub async fn handle_raw(&self, raw: &str) -> CpiResponse {
        match serde_json::from_str::<CpiRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(err) => CpiResponse::fail(&CpiError::BadRequest(format!(
                "undecodable request frame: {err}"
            ))),
        }
    }

    pub async fn handle(&self, request: CpiRequest) -> CpiResponse {
        tracing::info!(method = %request.method, context = %request.context, "Dispatching");
        match self.route(&request).await {
            Ok(result) => CpiResponse::ok(result),
            Err(err) => {
                tracing::error!(method = %request.method, error = %err, "Request failed");
                CpiResponse::fail(&err)
            }
        }
    }

    async fn route(&self, request: &CpiRequest) -> Result<Value> {
        let args = &request.arguments;
        match request.method.as_str() {
            "create_vm" => {
                let spec: VmSpec = decoded_arg(args, 0, "vm spec")?;
                let (id, observed) = self.orchestrator.create(&spec).await?;
                Ok(json!([id.serialize(), observed]))
            }
            "delete_vm" => {
                self.orchestrator.delete(string_arg(args, 0, "vm_cid")?).await?;
                Ok(Value::Null)
            }
            "has_vm" => {
                let present = self
                    .orchestrator
                    .has_vm(string_arg(args, 0, "vm_cid")?)
                    .await?;
                Ok(json!(present))
            }
            "reboot_vm" => {
                self.orchestrator.reboot(string_arg(args, 0, "vm_cid")?).await?;
                Ok(Value::Null)
            }
            "set_vm_metadata" => {
                let tags: HashMap<String, String> = decoded_arg(args, 1, "metadata")?;
                self.orchestrator
                    .set_tags(string_arg(args, 0, "vm_cid")?, &tags)
                    .await?;
                Ok(Value::Null)
            }
            "attach_disk" => {
                let lun = self
                    .orchestrator
                    .attach_disk(
                        string_arg(args, 0, "vm_cid")?,
                        string_arg(args, 1, "disk_cid")?,
                    )
                    .await?;
                Ok(json!(lun))
            }
            "detach_disk" => {
                self.orchestrator
                    .detach_disk(
                        string_arg(args, 0, "vm_cid")?,
                        string_arg(args, 1, "disk_cid")?,
                    )
                    .await?;
                Ok(Value::Null)
            }
            "create_disk" => {
                let props: DiskProps = decoded_arg(args, 0, "disk props")?;
                let id = self.orchestrator.create_disk(&props).await?;
                Ok(json!(id.serialize()))
            }
            "delete_disk" => {
                self.orchestrator
                    .delete_disk(string_arg(args, 0, "disk_cid")?)
                    .await?;
                Ok(Value::Null)
            }
            "has_disk" => {
                let present = self
                    .orchestrator
                    .has_disk(string_arg(args, 0, "disk_cid")?)
                    .await?;
                Ok(json!(present))
            }
            other => Err(CpiError::NotImplemented(other.to_string())),
        }
    }
}

fn string_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| CpiError::BadRequest(format!("argument {index} ({name}) must be a string")))
}

fn decoded_arg<T: serde::de::DeserializeOwned>(
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| CpiError::BadRequest(format!("argument {index} ({name}) is missing")))?;
    serde_json::from_value(value.clone())
        .map_err(|err| CpiError::BadRequest(format!("argument {index} ({name}): {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorConfig;
    use crate::stemcell::CatalogResolver;
    use cumulus_arm::testing::{empty_response, json_response, ScriptedTransport};
    use cumulus_arm::transport::Method;
    use cumulus_arm::{ArmClient, ArmConfig};
    use cumulus_lock::FileBackend;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_dispatcher(transport: Arc<ScriptedTransport>, lock_dir: &std::path::Path) -> Dispatcher {
        transport.always(
            Method::Post,
            "/oauth2/token",
            json_response(200, serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })),
        );
        let config: ArmConfig = serde_json::from_value(serde_json::json!({
            "subscription_id": "sub-1",
            "tenant_id": "t",
            "client_id": "c",
            "client_secret": "s",
            "default_resource_group": "rg-default",
            "location": "westus",
            "retry": { "max_retries": 0, "default_backoff_secs": 0, "poll_interval_secs": 0 }
        }))
        .unwrap();
        let client = Arc::new(ArmClient::new(transport, config));
        let backend = Arc::new(FileBackend::new(lock_dir));
        let orchestrator = VmOrchestrator::new(
            client,
            backend,
            Arc::new(CatalogResolver::new(HashMap::new())),
            OrchestratorConfig {
                lock_poll_ms: 5,
                ..OrchestratorConfig::default()
            },
        );
        Dispatcher::new(orchestrator)
    }

    #[tokio::test]
    async fn test_unknown_method_reports_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(Arc::new(ScriptedTransport::new()), dir.path());

        let response = dispatcher
            .handle_raw(r#"{"method":"snapshot_disk","arguments":[]}"#)
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.kind, "NotImplemented");
        assert!(!error.ok_to_retry);
        assert!(response.result.is_null());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(Arc::new(ScriptedTransport::new()), dir.path());

        let response = dispatcher.handle_raw("{not json").await;

        assert_eq!(response.error.unwrap().kind, "BadRequest");
    }

    #[tokio::test]
    async fn test_missing_argument_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher(Arc::new(ScriptedTransport::new()), dir.path());

        let response = dispatcher
            .handle_raw(r#"{"method":"delete_vm","arguments":[]}"#)
            .await;

        assert_eq!(response.error.unwrap().kind, "BadRequest");
    }

    #[tokio::test]
    async fn test_has_vm_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::Get,
            "/virtualMachines/vm-1",
            json_response(200, serde_json::json!({ "name": "vm-1" })),
        );
        let dispatcher = test_dispatcher(transport, dir.path());

        let present = dispatcher
            .handle_raw(r#"{"method":"has_vm","arguments":["vm-1"]}"#)
            .await;
        assert_eq!(present.result, serde_json::json!(true));
        assert!(present.error.is_none());

        // Unscripted GET falls through to 404: the VM is absent.
        let absent = dispatcher
            .handle_raw(r#"{"method":"has_vm","arguments":["vm-2"]}"#)
            .await;
        assert_eq!(absent.result, serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_reboot_posts_restart_action() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.enqueue(
            Method::Get,
            "/virtualMachines/vm-1",
            json_response(200, serde_json::json!({ "name": "vm-1" })),
        );
        transport.enqueue(Method::Post, "/vm-1/restart", empty_response(200));
        let dispatcher = test_dispatcher(transport.clone(), dir.path());

        let response = dispatcher
            .handle_raw(r#"{"method":"reboot_vm","arguments":["vm-1"]}"#)
            .await;

        assert!(response.error.is_none());
        assert_eq!(transport.count(Method::Post, "/vm-1/restart"), 1);
    }

    #[tokio::test]
    async fn test_disk_methods_round_trip_an_opaque_cid() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.always(
            Method::Get,
            "/resourceGroups/rg-default?api-version",
            json_response(200, serde_json::json!({ "name": "rg-default" })),
        );
        transport.always(
            Method::Put,
            "/disks/disk-",
            json_response(200, serde_json::json!({})),
        );
        transport.always(
            Method::Get,
            "/disks/disk-",
            json_response(200, serde_json::json!({})),
        );
        let dispatcher = test_dispatcher(transport.clone(), dir.path());

        let created = dispatcher
            .handle_raw(r#"{"method":"create_disk","arguments":[{"size_gb":16}]}"#)
            .await;
        assert!(created.error.is_none());
        let cid = created.result.as_str().unwrap().to_string();
        assert!(cid.starts_with("v2;"));

        let present = dispatcher
            .handle_raw(&format!(r#"{{"method":"has_disk","arguments":["{cid}"]}}"#))
            .await;
        assert_eq!(present.result, serde_json::json!(true));

        let deleted = dispatcher
            .handle_raw(&format!(r#"{{"method":"delete_disk","arguments":["{cid}"]}}"#))
            .await;
        assert!(deleted.error.is_none());
        assert_eq!(transport.count(Method::Delete, "/disks/disk-"), 1);
    }

    #[tokio::test]
    async fn test_error_frame_carries_retry_hint() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        // Every GET of the VM fails transiently until retries run out.
        transport.always(Method::Get, "/virtualMachines/vm-1", empty_response(503));
        let dispatcher = test_dispatcher(transport, dir.path());

        let response = dispatcher
            .handle_raw(r#"{"method":"has_vm","arguments":["vm-1"]}"#)
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.kind, "RetryExhausted");
        assert!(error.ok_to_retry);
    }
}
