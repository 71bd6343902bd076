//! Shared fakes and wiring for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use caf_onboarding::config::{OnboardingConfig, RetryPolicy};
use caf_onboarding::error::{ActivationError, EngineError, ProvisionError};
use caf_onboarding::onboarding::memory::{
    MemoryCorrelationStore, MemoryDeadLetterSink, MemoryStagingSink,
};
use caf_onboarding::onboarding::{
    ActivationApi, ActivationRequest, ActivationStep, ApprovalDecision, CorrelationStore,
    CorrelationToken, EngineEvent, IdentityProvisioner, NewOnboardingRecord, OnboardingDeps,
    OnboardingRecord, OnboardingServices, ProcessEngine, RecordStatus, RouteMode, TokenRecord,
    Variables, ZoneConfig, ZoneRoutingTable,
};

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub id: String,
    pub active: bool,
    pub variables: Variables,
}

#[derive(Default)]
struct EngineState {
    instances: HashMap<String, FakeInstance>,
    tasks: HashMap<String, String>,
    completed: Vec<(String, Variables)>,
    signals: Vec<(String, String)>,
    start_failures: VecDeque<EngineError>,
    signal_failures: VecDeque<EngineError>,
    complete_failures: VecDeque<EngineError>,
    /// Start lands in the engine but the reply never arrives.
    start_hangs_after_landing: bool,
    /// Signal lands but the reply never arrives.
    signal_hangs_after_landing: bool,
}

/// Scripted in-memory process engine.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<EngineState>,
    start_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl ScriptedEngine {
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self, err: EngineError) {
        self.state.lock().unwrap().start_failures.push_back(err);
    }

    pub fn fail_next_signal(&self, err: EngineError) {
        self.state.lock().unwrap().signal_failures.push_back(err);
    }

    pub fn fail_next_complete(&self, err: EngineError) {
        self.state.lock().unwrap().complete_failures.push_back(err);
    }

    pub fn hang_after_start_lands(&self) {
        self.state.lock().unwrap().start_hangs_after_landing = true;
    }

    pub fn hang_after_signal_lands(&self) {
        self.state.lock().unwrap().signal_hangs_after_landing = true;
    }

    /// Simulate the engine reaching the approval user task.
    pub fn open_task(&self, business_key: &str) -> String {
        let task_id = format!("task-{}", business_key);
        self.state
            .lock()
            .unwrap()
            .tasks
            .insert(business_key.to_string(), task_id.clone());
        task_id
    }

    pub fn end_instance(&self, business_key: &str) {
        if let Some(instance) = self.state.lock().unwrap().instances.get_mut(business_key) {
            instance.active = false;
        }
    }

    /// Engine-side instance created outside this service.
    pub fn seed_instance(&self, business_key: &str, id: &str) {
        self.state.lock().unwrap().instances.insert(
            business_key.to_string(),
            FakeInstance {
                id: id.to_string(),
                active: true,
                variables: Variables::new(),
            },
        );
    }

    pub fn instance(&self, business_key: &str) -> Option<FakeInstance> {
        self.state.lock().unwrap().instances.get(business_key).cloned()
    }

    pub fn signals(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn completed(&self) -> Vec<(String, Variables)> {
        self.state.lock().unwrap().completed.clone()
    }
}

#[async_trait]
impl ProcessEngine for ScriptedEngine {
    async fn start_instance(
        &self,
        _process_key: &str,
        business_key: &str,
        variables: &Variables,
    ) -> Result<String, EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the race window for concurrency tests.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let hang = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.start_failures.pop_front() {
                return Err(err);
            }
            let id = format!("pi-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            state.instances.insert(
                business_key.to_string(),
                FakeInstance {
                    id: id.clone(),
                    active: true,
                    variables: variables.clone(),
                },
            );
            if state.start_hangs_after_landing {
                state.start_hangs_after_landing = false;
                true
            } else {
                return Ok(id);
            }
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(EngineError::Transport("reply lost".into()))
    }

    async fn find_instance(&self, business_key: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .get(business_key)
            .filter(|i| i.active)
            .map(|i| i.id.clone()))
    }

    async fn find_pending_task(
        &self,
        business_key: &str,
        _task_key: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self.state.lock().unwrap().tasks.get(business_key).cloned())
    }

    async fn complete_task(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.complete_failures.pop_front() {
            return Err(err);
        }
        state.tasks.retain(|_, id| id != task_id);
        state.completed.push((task_id.to_string(), variables.clone()));
        Ok(())
    }

    async fn find_completed_task(
        &self,
        business_key: &str,
        _task_key: &str,
    ) -> Result<Option<Variables>, EngineError> {
        let task_id = format!("task-{}", business_key);
        Ok(self
            .state
            .lock()
            .unwrap()
            .completed
            .iter()
            .rev()
            .find(|(id, _)| *id == task_id)
            .map(|(_, vars)| vars.clone()))
    }

    async fn signal_instance(
        &self,
        instance_id: &str,
        signal_name: &str,
        _variables: &Variables,
    ) -> Result<(), EngineError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            let hang = std::mem::take(&mut state.signal_hangs_after_landing);
            if !hang {
                if let Some(err) = state.signal_failures.pop_front() {
                    return Err(err);
                }
            }
            state
                .signals
                .push((instance_id.to_string(), signal_name.to_string()));
            hang
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Memory store whose writes can be made to fail once.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryCorrelationStore,
    fail_bind: AtomicBool,
    fail_status: AtomicBool,
    fail_settle: AtomicBool,
}

impl FlakyStore {
    pub async fn record_count(&self) -> usize {
        self.inner.record_count().await
    }

    pub fn fail_next_bind(&self) {
        self.fail_bind.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_status_write(&self) {
        self.fail_status.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_settle(&self) {
        self.fail_settle.store(true, Ordering::SeqCst);
    }
}

fn tripped(flag: &AtomicBool) -> anyhow::Result<()> {
    if flag.swap(false, Ordering::SeqCst) {
        anyhow::bail!("db blip");
    }
    Ok(())
}

#[async_trait]
impl CorrelationStore for FlakyStore {
    async fn find_by_ref(&self, business_ref: &str) -> anyhow::Result<Option<OnboardingRecord>> {
        self.inner.find_by_ref(business_ref).await
    }

    async fn insert_if_absent(&self, record: &NewOnboardingRecord) -> anyhow::Result<OnboardingRecord> {
        self.inner.insert_if_absent(record).await
    }

    async fn update_status(&self, business_ref: &str, status: RecordStatus) -> anyhow::Result<bool> {
        tripped(&self.fail_status)?;
        self.inner.update_status(business_ref, status).await
    }

    async fn set_permanent_identity(&self, business_ref: &str, identity: &str) -> anyhow::Result<bool> {
        self.inner.set_permanent_identity(business_ref, identity).await
    }

    async fn bind_instance(&self, business_ref: &str, process_instance_id: &str) -> anyhow::Result<bool> {
        tripped(&self.fail_bind)?;
        self.inner.bind_instance(business_ref, process_instance_id).await
    }

    async fn put_token(&self, token: &CorrelationToken) -> anyhow::Result<Option<String>> {
        self.inner.put_token(token).await
    }

    async fn load_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> anyhow::Result<Option<TokenRecord>> {
        self.inner.load_token(business_ref, step).await
    }

    async fn consume_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
    ) -> anyhow::Result<bool> {
        self.inner.consume_token(business_ref, step, token).await
    }

    async fn settle_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
        status: RecordStatus,
    ) -> anyhow::Result<bool> {
        tripped(&self.fail_settle)?;
        self.inner.settle_token(business_ref, step, token, status).await
    }
}

// ─── Provisioner ─────────────────────────────────────────────────────────────

pub struct FakeProvisioner {
    responses: Mutex<VecDeque<Result<String, ProvisionError>>>,
    default_identity: String,
    calls: AtomicUsize,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_identity: "IMSI-999".to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeProvisioner {
    pub fn push_response(&self, response: Result<String, ProvisionError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvisioner for FakeProvisioner {
    async fn provision(&self, _plan_code: &str, _business_ref: &str) -> Result<String, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_identity.clone()))
    }
}

// ─── Activation API ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeActivationApi {
    requests: Mutex<Vec<(ActivationStep, ActivationRequest)>>,
    failures: Mutex<VecDeque<ActivationError>>,
}

impl FakeActivationApi {
    pub fn fail_next(&self, err: ActivationError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn requests(&self) -> Vec<(ActivationStep, ActivationRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActivationApi for FakeActivationApi {
    async fn send(&self, step: ActivationStep, request: &ActivationRequest) -> Result<(), ActivationError> {
        self.requests.lock().unwrap().push((step, request.clone()));
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub services: OnboardingServices,
    pub config: OnboardingConfig,
    pub store: Arc<FlakyStore>,
    pub engine: Arc<ScriptedEngine>,
    pub provisioner: Arc<FakeProvisioner>,
    pub activation: Arc<FakeActivationApi>,
    pub staging: Arc<MemoryStagingSink>,
    pub dead_letters: Arc<MemoryDeadLetterSink>,
}

pub fn zone(code: &str, preact: RouteMode, tv: RouteMode, finalact: RouteMode, commission: RouteMode) -> ZoneConfig {
    ZoneConfig {
        zone_code: code.to_string(),
        preact_mode: preact,
        tv_mode: tv,
        finalact_mode: finalact,
        commission_mode: commission,
    }
}

pub fn test_config() -> OnboardingConfig {
    let mut config = OnboardingConfig::default();
    config.engine.timeout_ms = 200;
    config.provisioner.timeout_ms = 200;
    config.activation.timeout_ms = 200;
    config.activation.callback_base_url = "http://onboard.test".to_string();
    config.retry = RetryPolicy {
        max_attempts: 3,
        backoff_ms: 10,
    };
    config.zones = vec![zone(
        "Z1",
        RouteMode::Api,
        RouteMode::Staging,
        RouteMode::Api,
        RouteMode::Staging,
    )];
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: OnboardingConfig) -> Harness {
    let store = Arc::new(FlakyStore::default());
    let engine = Arc::new(ScriptedEngine::default());
    let provisioner = Arc::new(FakeProvisioner::default());
    let activation = Arc::new(FakeActivationApi::default());
    let staging = Arc::new(MemoryStagingSink::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());

    let services = OnboardingServices::new(
        OnboardingDeps {
            store: store.clone(),
            engine: engine.clone(),
            provisioner: provisioner.clone(),
            activation_api: activation.clone(),
            staging: staging.clone(),
            dead_letters: dead_letters.clone(),
            routing: ZoneRoutingTable::from_configs(config.zones.clone()),
        },
        &config,
    );

    Harness {
        services,
        config,
        store,
        engine,
        provisioner,
        activation,
        staging,
        dead_letters,
    }
}

pub fn caf_event(caf_ref: &str, plan_code: &str) -> Vec<u8> {
    json!({
        "caf_ref_no": caf_ref,
        "plan_code": plan_code,
        "zone_code": "Z1",
        "pos_hrno": "POS-7",
        "is_agent": false,
    })
    .to_string()
    .into_bytes()
}

pub fn callback_body(caf_ref: &str, ack: &str) -> Vec<u8> {
    json!({ "cafRefNo": caf_ref, "ackStatus": ack })
        .to_string()
        .into_bytes()
}

/// Drive `caf_ref` through ingestion and approval.
pub async fn approved(h: &Harness, caf_ref: &str) {
    h.services
        .gate
        .ingest(&caf_event(caf_ref, "USIM-PREMIUM"))
        .await
        .unwrap();
    h.services
        .lifecycle
        .record_engine_event(caf_ref, EngineEvent::ApprovalTaskCreated)
        .await
        .unwrap();
    h.engine.open_task(caf_ref);
    h.services
        .lifecycle
        .complete_task(
            caf_ref,
            &ApprovalDecision {
                approved: true,
                user: "ops1".to_string(),
            },
        )
        .await
        .unwrap();
}
