//! End-to-end lifecycle scenarios driven through the [`Reconcile`]
//! contract against scripted in-memory services.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use authorize_provider::{
    OpContext, ReadOutcome, Reconcile, ResourceId, Value,
    expr::{Processor, ValueType, ValueTypeKind},
    resource::{
        api_service::{
            self, ApiService, ApiServiceClient, ApiServiceDto, ApiServiceReconciler,
            AuthorizationServer,
        },
        deployment::{Deployment, DeploymentClient, DeploymentDto, DeploymentReconciler},
        trust_framework::attribute::{
            TrustFrameworkAttribute, TrustFrameworkAttributeClient, TrustFrameworkAttributeDto,
            TrustFrameworkAttributeReconciler,
        },
    },
    transport::{ApiError, EnvironmentClient, ErrorModel, RetryPolicy},
};
use http::StatusCode;
use serde_json::json;

fn resource_id(tail: u32) -> ResourceId {
    format!("00000000-0000-4000-8000-{tail:012}")
        .parse()
        .unwrap()
}

fn environment_id() -> ResourceId {
    resource_id(1)
}

fn forbidden() -> ApiError {
    ApiError::Response {
        status: StatusCode::FORBIDDEN,
        error: ErrorModel::default(),
    }
}

fn referenced_entity() -> ApiError {
    ApiError::Response {
        status: StatusCode::BAD_REQUEST,
        error: ErrorModel {
            code: Some("REQUEST_FAILED".to_owned()),
            message: Some("The entity is referenced by another entity".to_owned()),
            ..ErrorModel::default()
        },
    }
}

/// A scripted service: responses are dequeued in call order, request
/// bodies are recorded for later inspection.
struct Script<T> {
    responses: Mutex<VecDeque<Result<T, ApiError>>>,
    bodies: Mutex<Vec<serde_json::Value>>,
    environment_gone: AtomicBool,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            responses: Mutex::default(),
            bodies: Mutex::default(),
            environment_gone: AtomicBool::new(false),
        }
    }
}

impl<T> Script<T> {
    fn respond_with(&self, response: Result<T, ApiError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn next(&self) -> Result<T, ApiError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("test script ran out of responses")
    }

    fn record_body<B: serde::Serialize>(&self, body: &B) {
        self.bodies
            .lock()
            .unwrap()
            .push(serde_json::to_value(body).unwrap());
    }

    fn bodies(&self) -> Vec<serde_json::Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn delete_environment(&self) {
        self.environment_gone.store(true, Ordering::SeqCst);
    }

    fn probe_environment(&self) -> Result<(), ApiError> {
        if self.environment_gone.load(Ordering::SeqCst) {
            Err(ApiError::not_found())
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
struct ApiServiceServer {
    script: Arc<Script<ApiServiceDto>>,
}

#[async_trait]
impl EnvironmentClient for ApiServiceServer {
    async fn read_environment(&self, _: &ResourceId) -> Result<(), ApiError> {
        self.script.probe_environment()
    }
}

#[async_trait]
impl ApiServiceClient for ApiServiceServer {
    async fn create_api_service(
        &self,
        _: &ResourceId,
        body: &ApiServiceDto,
    ) -> Result<ApiServiceDto, ApiError> {
        self.script.record_body(body);
        self.script.next()
    }

    async fn read_api_service(
        &self,
        _: &ResourceId,
        _: &ResourceId,
    ) -> Result<ApiServiceDto, ApiError> {
        self.script.next()
    }

    async fn update_api_service(
        &self,
        _: &ResourceId,
        _: &ResourceId,
        body: &ApiServiceDto,
    ) -> Result<ApiServiceDto, ApiError> {
        self.script.record_body(body);
        self.script.next()
    }

    async fn delete_api_service(&self, _: &ResourceId, _: &ResourceId) -> Result<(), ApiError> {
        self.script.next().map(|_| ())
    }
}

#[derive(Clone, Default)]
struct DeploymentServer {
    script: Arc<Script<DeploymentDto>>,
}

#[async_trait]
impl EnvironmentClient for DeploymentServer {
    async fn read_environment(&self, _: &ResourceId) -> Result<(), ApiError> {
        self.script.probe_environment()
    }
}

#[async_trait]
impl DeploymentClient for DeploymentServer {
    async fn deploy_api_service(
        &self,
        _: &ResourceId,
        _: &ResourceId,
    ) -> Result<DeploymentDto, ApiError> {
        self.script.next()
    }

    async fn read_deployment(
        &self,
        _: &ResourceId,
        _: &ResourceId,
    ) -> Result<DeploymentDto, ApiError> {
        self.script.next()
    }
}

#[derive(Clone, Default)]
struct EditorServer {
    script: Arc<Script<TrustFrameworkAttributeDto>>,
    deletes: Arc<Mutex<VecDeque<Result<(), ApiError>>>>,
}

impl EditorServer {
    fn respond_to_delete(&self, response: Result<(), ApiError>) {
        self.deletes.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl EnvironmentClient for EditorServer {
    async fn read_environment(&self, _: &ResourceId) -> Result<(), ApiError> {
        self.script.probe_environment()
    }
}

#[async_trait]
impl TrustFrameworkAttributeClient for EditorServer {
    async fn create_attribute(
        &self,
        _: &ResourceId,
        body: &TrustFrameworkAttributeDto,
    ) -> Result<TrustFrameworkAttributeDto, ApiError> {
        self.script.record_body(body);
        self.script.next()
    }

    async fn read_attribute(
        &self,
        _: &ResourceId,
        _: &ResourceId,
    ) -> Result<TrustFrameworkAttributeDto, ApiError> {
        self.script.next()
    }

    async fn update_attribute(
        &self,
        _: &ResourceId,
        _: &ResourceId,
        body: &TrustFrameworkAttributeDto,
    ) -> Result<TrustFrameworkAttributeDto, ApiError> {
        self.script.record_body(body);
        self.script.next()
    }

    async fn delete_attribute(&self, _: &ResourceId, _: &ResourceId) -> Result<(), ApiError> {
        self.deletes
            .lock()
            .unwrap()
            .pop_front()
            .expect("test script ran out of delete responses")
    }
}

fn declared_service() -> ApiService {
    ApiService {
        environment_id: Value::Known(environment_id()),
        name: Value::Known("svc".to_owned()),
        base_urls: Value::Known(vec![
            "https://a/svc".to_owned(),
            "https://a/svc/1".to_owned(),
        ]),
        authorization_server: Value::Known(AuthorizationServer::pingone_sso(resource_id(11))),
        ..ApiService::default()
    }
}

fn service_response(base_urls: &[&str]) -> ApiServiceDto {
    serde_json::from_value(json!({
        "id": "00000000-0000-4000-8000-000000000021",
        "name": "svc",
        "baseUrls": base_urls,
        "authorizationServer": {
            "type": "PINGONE_SSO",
            "resource": {"id": "00000000-0000-4000-8000-000000000011"},
        },
        "accessControl": {"custom": {"enabled": false}},
        "directory": {"type": "PINGONE_SSO"},
        "policy": {"id": "00000000-0000-4000-8000-000000000031"},
    }))
    .unwrap()
}

#[tokio::test]
async fn create_sends_the_declared_fields_and_records_computed_ones() {
    let server = ApiServiceServer::default();
    server
        .script
        .respond_with(Ok(service_response(&["https://a/svc", "https://a/svc/1"])));
    let reconciler = ApiServiceReconciler::new(server.clone());

    let state = reconciler
        .create(&OpContext::new(), declared_service())
        .await
        .unwrap();

    assert_eq!(
        server.script.bodies(),
        [json!({
            "name": "svc",
            "baseUrls": ["https://a/svc", "https://a/svc/1"],
            "authorizationServer": {
                "type": "PINGONE_SSO",
                "resource": {"id": "00000000-0000-4000-8000-000000000011"},
            },
            "accessControl": {"custom": {"enabled": false}},
            "directory": {"type": "PINGONE_SSO"},
        })]
    );
    assert_eq!(state.id, Value::Known(resource_id(21)));
    assert_eq!(state.policy_id, Value::Known(resource_id(31)));
}

#[tokio::test]
async fn unchanged_configuration_reads_back_identical_state() {
    let server = ApiServiceServer::default();
    server
        .script
        .respond_with(Ok(service_response(&["https://a/svc", "https://a/svc/1"])));
    server
        .script
        .respond_with(Ok(service_response(&["https://a/svc", "https://a/svc/1"])));
    let reconciler = ApiServiceReconciler::new(server);

    let created = reconciler
        .create(&OpContext::new(), declared_service())
        .await
        .unwrap();
    let refreshed = reconciler
        .read(&OpContext::new(), created.clone())
        .await
        .unwrap();

    // Identical recorded state means the host plans zero changes.
    assert_eq!(refreshed.into_current().unwrap(), created);
}

#[tokio::test]
async fn shrinking_the_url_set_is_an_in_place_update() {
    let server = ApiServiceServer::default();
    server
        .script
        .respond_with(Ok(service_response(&["https://a/svc"])));
    let reconciler = ApiServiceReconciler::new(server.clone());

    let mut desired = declared_service();
    desired.id = Value::Known(resource_id(21));
    desired.base_urls = Value::Known(vec!["https://a/svc".to_owned()]);

    let state = reconciler.update(&OpContext::new(), desired).await.unwrap();

    assert_eq!(
        server.script.bodies()[0]["baseUrls"],
        json!(["https://a/svc"])
    );
    assert_eq!(state.base_urls, Value::Known(vec!["https://a/svc".to_owned()]));
}

#[test]
fn custom_access_control_and_issuer_type_force_replacement() {
    let replacing: Vec<_> = api_service::SCHEMA.replacement_paths().collect();

    assert!(replacing.contains(&"access_control.custom.enabled"));
    assert!(replacing.contains(&"authorization_server.type"));
    assert!(!replacing.contains(&"base_urls"));
}

#[tokio::test]
async fn out_of_band_deletion_is_reported_as_gone() {
    let server = ApiServiceServer::default();
    server.script.respond_with(Err(ApiError::not_found()));
    let reconciler = ApiServiceReconciler::new(server);

    let mut recorded = declared_service();
    recorded.id = Value::Known(resource_id(21));

    let outcome = reconciler.read(&OpContext::new(), recorded).await.unwrap();

    match outcome {
        ReadOutcome::Gone(warning) => {
            assert_eq!(warning.summary(), "Requested resource not found");
        }
        ReadOutcome::Current(_) => panic!("expected the resource to be gone"),
    }
}

#[tokio::test]
async fn deleted_environment_downgrades_a_permissions_error() {
    let server = ApiServiceServer::default();
    server.script.delete_environment();
    server.script.respond_with(Err(forbidden()));
    let reconciler = ApiServiceReconciler::new(server);

    let mut recorded = declared_service();
    recorded.id = Value::Known(resource_id(21));

    let outcome = reconciler.read(&OpContext::new(), recorded).await.unwrap();

    match outcome {
        ReadOutcome::Gone(warning) => {
            assert_eq!(warning.summary(), "Environment no longer exists");
        }
        ReadOutcome::Current(_) => panic!("expected the resource to be gone"),
    }
}

#[tokio::test]
async fn import_parses_the_composite_id_into_skeleton_state() {
    let reconciler = ApiServiceReconciler::new(ApiServiceServer::default());

    let state = reconciler
        .import("00000000-0000-4000-8000-000000000001/00000000-0000-4000-8000-000000000021")
        .unwrap();

    assert_eq!(state.environment_id, Value::Known(environment_id()));
    assert_eq!(state.id, Value::Known(resource_id(21)));
    assert_eq!(state.name, Value::Null);
}

#[tokio::test]
async fn malformed_import_ids_name_the_expected_format() {
    let reconciler = ApiServiceReconciler::new(ApiServiceServer::default());

    let error = reconciler.import("abc//def").unwrap_err();

    assert!(
        error
            .to_string()
            .contains("malformed import id"),
        "unexpected error: {error}"
    );
}

fn triggers(pairs: &[(&str, &str)]) -> Value<BTreeMap<String, Value<String>>> {
    Value::Known(
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), Value::Known((*value).to_owned())))
            .collect(),
    )
}

fn deployment_response() -> DeploymentDto {
    serde_json::from_value(json!({
        "apiServer": {"id": "00000000-0000-4000-8000-000000000041"},
        "decisionEndpoint": {"id": "00000000-0000-4000-8000-000000000042"},
        "policy": {"id": "00000000-0000-4000-8000-000000000031"},
        "deployedAt": "2024-05-02T15:04:05Z",
        "status": {"code": "DEPLOYMENT_SUCCESSFUL"},
    }))
    .unwrap()
}

#[tokio::test]
async fn deployment_trigger_values_drive_replacement_but_not_key_churn() {
    let server = DeploymentServer::default();
    server.script.respond_with(Ok(deployment_response()));
    let reconciler = DeploymentReconciler::new(server);

    let desired = Deployment {
        environment_id: Value::Known(environment_id()),
        api_service_id: Value::Known(resource_id(21)),
        redeployment_trigger_values: triggers(&[("triggerA", "valueA1")]),
        ..Deployment::default()
    };
    let deployed = reconciler.create(&OpContext::new(), desired).await.unwrap();

    assert_eq!(
        deployed.redeployment_trigger_values,
        triggers(&[("triggerA", "valueA1")])
    );
    assert_eq!(deployed.decision_endpoint_id, Value::Known(resource_id(42)));

    // Changing a shared key's value forces a fresh deployment.
    let mut changed = deployed.clone();
    changed.redeployment_trigger_values = triggers(&[("triggerA", "valueA2")]);
    assert!(Deployment::triggers_replacement(&deployed, &changed));

    // Adding a key updates in place.
    let mut added = deployed.clone();
    added.redeployment_trigger_values =
        triggers(&[("triggerA", "valueA1"), ("triggerB", "w1")]);
    assert!(!Deployment::triggers_replacement(&deployed, &added));

    // Removing a key updates in place as well.
    let removed_from = Deployment {
        redeployment_trigger_values: triggers(&[("triggerA", "valueA1"), ("triggerB", "w1")]),
        ..deployed.clone()
    };
    let mut removed = deployed.clone();
    removed.redeployment_trigger_values = triggers(&[("triggerA", "valueA1")]);
    assert!(!Deployment::triggers_replacement(&removed_from, &removed));
}

#[tokio::test]
async fn deployment_update_refreshes_status_and_keeps_the_new_map() {
    let server = DeploymentServer::default();
    server.script.respond_with(Ok(deployment_response()));
    let reconciler = DeploymentReconciler::new(server);

    let desired = Deployment {
        environment_id: Value::Known(environment_id()),
        api_service_id: Value::Known(resource_id(21)),
        redeployment_trigger_values: triggers(&[("triggerA", "valueA1"), ("triggerB", "w1")]),
        ..Deployment::default()
    };

    let state = reconciler.update(&OpContext::new(), desired).await.unwrap();

    assert_eq!(
        state.redeployment_trigger_values,
        triggers(&[("triggerA", "valueA1"), ("triggerB", "w1")])
    );
    assert_eq!(
        state.status.as_known().unwrap().code,
        Value::Known("DEPLOYMENT_SUCCESSFUL".to_owned())
    );
}

fn chained_attribute(expressions: &[&str]) -> TrustFrameworkAttribute {
    TrustFrameworkAttribute {
        environment_id: Value::Known(environment_id()),
        name: Value::Known("Request.Payload fields".to_owned()),
        value_type: Value::Known(ValueType::of(ValueTypeKind::String)),
        processor: Value::Known(Processor::chain(
            "extract",
            expressions
                .iter()
                .map(|name| Processor::json_path(*name, format!("$.{name}"), ValueTypeKind::String))
                .collect(),
        )),
        ..TrustFrameworkAttribute::default()
    }
}

fn chain_body(id: Option<&str>, version: Option<&str>, expressions: &[&str]) -> serde_json::Value {
    let mut body = json!({
        "name": "Request.Payload fields",
        "processor": {
            "name": "extract",
            "type": "CHAIN",
            "processors": expressions
                .iter()
                .map(|name| json!({
                    "name": name,
                    "type": "JSON_PATH",
                    "expression": format!("$.{name}"),
                    "valueType": {"type": "STRING"},
                }))
                .collect::<Vec<_>>(),
        },
        "resolvers": [],
        "valueType": {"type": "STRING"},
    });
    if let Some(id) = id {
        body["id"] = json!(id);
    }
    if let Some(version) = version {
        body["version"] = json!(version);
    }
    body
}

fn chain_response(version: &str, expressions: &[&str]) -> TrustFrameworkAttributeDto {
    let mut response = chain_body(
        Some("00000000-0000-4000-8000-000000000051"),
        Some(version),
        expressions,
    );
    response["fullName"] = json!("Request.Payload fields");
    response["type"] = json!("ATTRIBUTE");
    serde_json::from_value(response).unwrap()
}

#[tokio::test]
async fn chain_processors_keep_their_order_through_create_and_reorder() {
    let server = EditorServer::default();
    // Create, then the update's version pre-read, then the update itself.
    server.script.respond_with(Ok(chain_response("1", &["a", "b", "c"])));
    server.script.respond_with(Ok(chain_response("1", &["a", "b", "c"])));
    server.script.respond_with(Ok(chain_response("2", &["a", "c", "b"])));
    let reconciler = TrustFrameworkAttributeReconciler::new(server.clone());

    let created = reconciler
        .create(&OpContext::new(), chained_attribute(&["a", "b", "c"]))
        .await
        .unwrap();
    assert_eq!(created.version, Value::Known("1".to_owned()));

    let mut reordered = chained_attribute(&["a", "c", "b"]);
    reordered.id = created.id.clone();
    let updated = reconciler.update(&OpContext::new(), reordered).await.unwrap();

    assert_eq!(
        server.script.bodies(),
        [
            chain_body(None, None, &["a", "b", "c"]),
            chain_body(
                Some("00000000-0000-4000-8000-000000000051"),
                Some("1"),
                &["a", "c", "b"],
            ),
        ]
    );
    assert_eq!(updated.version, Value::Known("2".to_owned()));
    assert_eq!(
        updated.processor,
        chained_attribute(&["a", "c", "b"]).processor
    );
}

#[tokio::test]
async fn referenced_editor_delete_retries_until_the_reference_is_released() {
    let server = EditorServer::default();
    server.respond_to_delete(Err(referenced_entity()));
    server.respond_to_delete(Ok(()));
    // Purge probe: the entity is already gone.
    server.script.respond_with(Err(ApiError::not_found()));
    let reconciler = TrustFrameworkAttributeReconciler::with_policies(
        server.clone(),
        RetryPolicy::immediate(5),
        RetryPolicy::immediate(3),
    );

    let mut recorded = chained_attribute(&["a"]);
    recorded.id = Value::Known(resource_id(51));

    let diagnostics = reconciler
        .delete(&OpContext::new(), recorded)
        .await
        .unwrap();

    assert!(diagnostics.is_empty());
    assert!(server.deletes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unrelated_request_failed_fails_the_delete_immediately() {
    let server = EditorServer::default();
    server.respond_to_delete(Err(ApiError::Response {
        status: StatusCode::BAD_REQUEST,
        error: ErrorModel {
            code: Some("REQUEST_FAILED".to_owned()),
            message: Some("The request body is malformed".to_owned()),
            ..ErrorModel::default()
        },
    }));
    let reconciler = TrustFrameworkAttributeReconciler::with_policies(
        server.clone(),
        RetryPolicy::immediate(5),
        RetryPolicy::immediate(3),
    );

    let mut recorded = chained_attribute(&["a"]);
    recorded.id = Value::Known(resource_id(51));

    let error = reconciler
        .delete(&OpContext::new(), recorded)
        .await
        .unwrap_err();

    assert!(error.to_string().contains("request failed"));
}
