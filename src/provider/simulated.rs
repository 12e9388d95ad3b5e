//! In-process simulated provider.
//!
//! Fabricates ids and outputs the way the real services shape them, keeps
//! resources and secrets in memory, and records every call with start and
//! finish offsets. Faults and latency can be injected per logical name,
//! which makes it the provider of choice for offline plans and tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::resource::Outputs;

use super::{Created, Provider, ProviderResult, SecretStore};

/// Input keys never echoed into outputs.
const HIDDEN_INPUTS: &[&str] = &["password", "secretString"];

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Operation.
    pub operation: Operation,
    /// Resource type.
    pub resource_type: String,
    /// Logical name, when known.
    pub name: String,
    /// Offset from provider creation when the call started.
    pub started: Duration,
    /// Offset from provider creation when the call finished.
    pub finished: Duration,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
struct SimResource {
    resource_type: String,
    name: String,
    outputs: Outputs,
}

#[derive(Debug, Default)]
struct SimState {
    resources: HashMap<String, SimResource>,
    secrets: HashMap<String, String>,
    calls: Vec<CallRecord>,
    faults: HashSet<(Operation, String)>,
    delays: HashMap<String, Duration>,
}

/// Simulated provider.
#[derive(Debug)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
    epoch: Instant,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// Creates an empty simulated provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            epoch: Instant::now(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `operation` fail for the resource with logical name `name`.
    pub fn fail_on(&self, operation: Operation, name: &str) {
        self.lock().faults.insert((operation, name.to_string()));
    }

    /// Clears an injected fault.
    pub fn clear_fault(&self, operation: Operation, name: &str) {
        self.lock().faults.remove(&(operation, name.to_string()));
    }

    /// Delays every call for logical name `name`.
    pub fn delay(&self, name: &str, delay: Duration) {
        self.lock().delays.insert(name.to_string(), delay);
    }

    /// Registers a resource that exists outside this program.
    pub fn insert_existing(&self, resource_type: &str, id: &str, outputs: Outputs) {
        self.lock().resources.insert(
            id.to_string(),
            SimResource {
                resource_type: resource_type.to_string(),
                name: id.to_string(),
                outputs,
            },
        );
    }

    /// Recorded calls, in completion order.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Recorded calls for a logical name.
    #[must_use]
    pub fn calls_for(&self, name: &str) -> Vec<CallRecord> {
        self.lock().calls.iter().filter(|c| c.name == name).cloned().collect()
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Outputs of a live resource.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<Outputs> {
        self.lock().resources.get(id).map(|r| r.outputs.clone())
    }

    /// Ids of live resources of a type.
    #[must_use]
    pub fn ids_of_type(&self, resource_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .resources
            .iter()
            .filter(|(_, r)| r.resource_type == resource_type)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Runs one call: bookkeeping, latency, fault check, then `body`.
    async fn call<T, F>(&self, operation: Operation, resource_type: &str, name: &str, body: F) -> ProviderResult<T>
    where
        F: FnOnce(&mut SimState) -> ProviderResult<T> + Send,
        T: Send,
    {
        let started = self.epoch.elapsed();
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.lock().delays.get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.lock();
            if state.faults.contains(&(operation, name.to_string())) {
                Err(ProviderError::rejected(
                    resource_type,
                    format!("injected {operation:?} failure for {name}"),
                ))
            } else {
                body(&mut state)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let finished = self.epoch.elapsed();
        self.lock().calls.push(CallRecord {
            operation,
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            started,
            finished,
            succeeded: result.is_ok(),
        });
        result
    }

    /// Logical name behind an id, falling back to the id itself.
    fn name_of(&self, id: &str) -> String {
        self.lock()
            .resources
            .get(id)
            .map_or_else(|| id.to_string(), |r| r.name.clone())
    }
}

/// Short, lowercase form of a type: `aws:rds:Instance` -> `instance`.
fn short_type(resource_type: &str) -> String {
    resource_type
        .rsplit(':')
        .next()
        .unwrap_or(resource_type)
        .to_lowercase()
}

fn random_alphanumeric(length: usize) -> String {
    let mut out = String::with_capacity(length);
    while out.len() < length {
        out.push_str(&Uuid::new_v4().simple().to_string());
    }
    out.truncate(length);
    out
}

fn input_str<'a>(inputs: &'a Value, key: &str) -> Option<&'a str> {
    inputs.get(key).and_then(Value::as_str)
}

/// Builds outputs for a resource from its inputs.
fn fabricate_outputs(resource_type: &str, name: &str, id: &str, inputs: &Value, state: &mut SimState) -> Outputs {
    let mut outputs = Outputs::new();
    if let Value::Object(map) = inputs {
        for (key, value) in map {
            if !HIDDEN_INPUTS.contains(&key.as_str()) {
                outputs.insert(key.clone(), value.clone());
            }
        }
    }
    outputs.insert(String::from("arn"), json!(format!("arn:sim:{resource_type}:{id}")));
    if !outputs.contains_key("name") {
        outputs.insert(String::from("name"), json!(name.to_lowercase()));
    }

    match resource_type {
        "random:RandomPassword" => {
            let length = inputs
                .get("length")
                .and_then(Value::as_u64)
                .and_then(|l| usize::try_from(l).ok())
                .unwrap_or(32);
            outputs.insert(String::from("result"), json!(random_alphanumeric(length)));
        }
        "aws:secretsmanager:SecretVersion" => {
            if let (Some(secret_id), Some(payload)) =
                (input_str(inputs, "secretId"), input_str(inputs, "secretString"))
            {
                state.secrets.insert(secret_id.to_string(), payload.to_string());
            }
            outputs.insert(String::from("versionId"), json!(id));
        }
        "aws:rds:Instance" => {
            let identifier = input_str(inputs, "identifier")
                .map_or_else(|| format!("{}-{}", name.to_lowercase(), &id[id.len().saturating_sub(8)..]), str::to_string);
            let port = inputs.get("port").and_then(Value::as_u64).unwrap_or(3306);
            let address = format!("{identifier}.sim.rds.local");
            outputs.insert(String::from("identifier"), json!(identifier));
            outputs.insert(String::from("address"), json!(address));
            outputs.insert(String::from("port"), json!(port));
            outputs.insert(String::from("endpoint"), json!(format!("{address}:{port}")));
        }
        "aws:rds:Proxy" => {
            let proxy_name = input_str(inputs, "name").map_or_else(|| name.to_lowercase(), str::to_string);
            outputs.insert(String::from("endpoint"), json!(format!("{proxy_name}.proxy-sim.rds.local")));
        }
        "aws:rds:ProxyDefaultTargetGroup" => {
            outputs.insert(String::from("name"), json!("default"));
        }
        _ => {}
    }
    outputs
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, resource_type: &str, name: &str, inputs: &Value) -> ProviderResult<Created> {
        let created = self
            .call(Operation::Create, resource_type, name, |state| {
                let id = format!("{}-{}", short_type(resource_type), &Uuid::new_v4().simple().to_string()[..8]);
                let outputs = fabricate_outputs(resource_type, name, &id, inputs, state);
                state.resources.insert(
                    id.clone(),
                    SimResource {
                        resource_type: resource_type.to_string(),
                        name: name.to_string(),
                        outputs: outputs.clone(),
                    },
                );
                Ok(Created { id, outputs })
            })
            .await?;
        info!("Simulated create of {resource_type} {name} -> {}", created.id);
        Ok(created)
    }

    async fn update(&self, resource_type: &str, id: &str, inputs: &Value) -> ProviderResult<Outputs> {
        let name = self.name_of(id);
        self.call(Operation::Update, resource_type, &name, |state| {
            let existing = state
                .resources
                .get(id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })?;
            let mut outputs = fabricate_outputs(resource_type, &existing.name, id, inputs, state);
            // Generated values survive in-place updates.
            for key in ["identifier", "address", "endpoint", "result"] {
                if let Some(previous) = existing.outputs.get(key) {
                    if inputs.get(key).is_none() {
                        outputs.insert(key.to_string(), previous.clone());
                    }
                }
            }
            if let Some(resource) = state.resources.get_mut(id) {
                resource.outputs.clone_from(&outputs);
            }
            Ok(outputs)
        })
        .await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        let name = self.name_of(id);
        self.call(Operation::Delete, resource_type, &name, |state| {
            state
                .resources
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
        })
        .await?;
        debug!("Simulated delete of {resource_type} {id}");
        Ok(())
    }

    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<Outputs>> {
        let name = self.name_of(id);
        self.call(Operation::Read, resource_type, &name, |state| {
            Ok(state.resources.get(id).map(|r| r.outputs.clone()))
        })
        .await
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[async_trait]
impl SecretStore for SimulatedProvider {
    async fn get(&self, id: &str) -> ProviderResult<Option<String>> {
        Ok(self.lock().secrets.get(id).cloned())
    }

    async fn put(&self, id: &str, value: &str) -> ProviderResult<()> {
        self.lock().secrets.insert(id.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instance_outputs() {
        let provider = SimulatedProvider::new();
        let created = provider
            .create(
                "aws:rds:Instance",
                "DbInstance",
                &json!({"identifier": "app-db", "port": 3307, "password": "p", "dbName": "app"}),
            )
            .await
            .expect("create");

        assert!(created.id.starts_with("instance-"));
        assert_eq!(created.outputs["endpoint"], json!("app-db.sim.rds.local:3307"));
        assert_eq!(created.outputs["dbName"], json!("app"));
        assert!(!created.outputs.contains_key("password"));
    }

    #[tokio::test]
    async fn test_secret_version_writes_payload() {
        let provider = SimulatedProvider::new();
        provider
            .create(
                "aws:secretsmanager:SecretVersion",
                "DbProxySecretVersion",
                &json!({"secretId": "secret-1", "secretString": "{\"password\":\"p\"}"}),
            )
            .await
            .expect("create");

        assert_eq!(
            provider.get("secret-1").await.expect("get"),
            Some(String::from("{\"password\":\"p\"}"))
        );
    }

    #[tokio::test]
    async fn test_random_password_length() {
        let provider = SimulatedProvider::new();
        let created = provider
            .create("random:RandomPassword", "DbPassword", &json!({"length": 32, "special": false}))
            .await
            .expect("create");
        let result = created.outputs["result"].as_str().expect("result");
        assert_eq!(result.len(), 32);
        assert!(result.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_fault_injection_and_not_found() {
        let provider = SimulatedProvider::new();
        provider.fail_on(Operation::Create, "Broken");

        let err = provider.create("t:x:Y", "Broken", &json!({})).await.expect_err("fault");
        assert!(matches!(err, ProviderError::Rejected { .. }));

        let err = provider.delete("t:x:Y", "missing").await.expect_err("missing");
        assert!(err.is_not_found());

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| !c.succeeded));
    }

    #[tokio::test]
    async fn test_update_keeps_generated_outputs() {
        let provider = SimulatedProvider::new();
        let created = provider
            .create("aws:rds:Instance", "Db", &json!({"instanceClass": "db.t4g.micro"}))
            .await
            .expect("create");
        let outputs = provider
            .update("aws:rds:Instance", &created.id, &json!({"instanceClass": "db.r6g.large"}))
            .await
            .expect("update");

        assert_eq!(outputs["identifier"], created.outputs["identifier"]);
        assert_eq!(outputs["instanceClass"], json!("db.r6g.large"));
        assert_eq!(provider.calls_for("Db").len(), 2);
    }
}
