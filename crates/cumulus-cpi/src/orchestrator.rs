//! VM lifecycle orchestration
//!
//! `create` and `delete` are multi-resource transactions: network
//! interfaces, a public address, disks and availability-set membership all
//! hang off one VM, every mutation is an asynchronous platform operation,
//! and other CPI processes may be working on the same availability set
//! concurrently. The rules:
//!
//! - the availability set is the only resource mutated by more than one VM
//!   lifecycle at a time; creations hold its **read** lock, deletion of the
//!   set itself requires the **write** lock and is skipped while busy
//! - a failed create retries wholesale on the platform's generic
//!   "provisioning failed" state, up to a configured bound
//! - on final failure, everything created so far is either enumerated for
//!   the operator (`keep_failed_vms`) or deleted best-effort, and the error
//!   names every resource involved
//! - deletes are idempotent: when the VM is already gone, sub-resources are
//!   located by the deterministic naming convention and removed anyway

use crate::error::{CpiError, Result};
use crate::ids::{DiskId, InstanceId};
use crate::props::{DiskProps, NetworkProps, VmSpec, MAX_NICS_PER_VM};
use crate::stemcell::StemcellResolver;
use cumulus_arm::path::{PROVIDER_COMPUTE, PROVIDER_NETWORK, PROVIDER_STORAGE};
use cumulus_arm::{ArmClient, ArmError, ResourcePath};
use cumulus_lock::{FileLock, LockBackend, ReadersWriterLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// LUN reserved for the ephemeral disk; data disks start above it.
const EPHEMERAL_LUN: u64 = 0;

fn default_create_retries() -> u32 {
    2
}

fn default_lock_ttl_secs() -> u64 {
    180
}

fn default_lock_poll_ms() -> u64 {
    100
}

fn default_max_data_disks() -> u32 {
    64
}

/// Orchestrator tuning; every bound is a field with a documented default.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Wholesale create retries on the platform's "provisioning failed"
    /// state. Default 2 (three attempts in total).
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,

    /// Leave partially created resources in place for operator inspection
    /// instead of rolling them back.
    #[serde(default)]
    pub keep_failed_vms: bool,

    /// TTL after which an unrefreshed lock is considered abandoned.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Polling interval while waiting on contended locks.
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,

    /// Platform bound on data-disk slots per VM.
    #[serde(default = "default_max_data_disks")]
    pub max_data_disks: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            create_retries: default_create_retries(),
            keep_failed_vms: false,
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_poll_ms: default_lock_poll_ms(),
            max_data_disks: default_max_data_disks(),
        }
    }
}

// Deterministic sub-resource naming. Deletes rely on these when the VM
// itself is already gone.
fn nic_name(vm: &str, index: usize) -> String {
    format!("{vm}-nic-{index}")
}

fn pip_name(vm: &str) -> String {
    format!("{vm}-pip")
}

fn os_disk_name(vm: &str) -> String {
    format!("{vm}-os")
}

fn ephemeral_disk_name(vm: &str) -> String {
    format!("{vm}-ephemeral")
}

/// Storage-account names: lowercase alphanumeric, at most 24 characters.
fn diagnostics_account_name(resource_group: &str) -> String {
    let mut name: String = resource_group
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    name.truncate(20);
    format!("{name}diag")
}

/// Lowest unused lun above the ephemeral slot, `None` when the platform
/// bound is exhausted.
fn lowest_free_lun(used: &HashSet<u64>, max_data_disks: u32) -> Option<u64> {
    (EPHEMERAL_LUN + 1..u64::from(max_data_disks)).find(|lun| !used.contains(lun))
}

fn last_segment(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Vm,
    Disk,
    Nic,
    PublicIp,
}

/// Ephemeral record of what one `create` call has created so far, kept only
/// to drive rollback and operator-facing error messages.
#[derive(Debug, Default)]
struct TransactionRecord {
    entries: Vec<(ResourceKind, String)>,
}

impl TransactionRecord {
    fn push(&mut self, kind: ResourceKind, name: String) {
        if !self.entries.iter().any(|(k, n)| *k == kind && *n == name) {
            self.entries.push((kind, name));
        }
    }

    fn of_kind(&self, kind: ResourceKind) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect()
    }

    fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(_, n)| n.clone()).collect()
    }
}

struct NicRef {
    id: String,
    private_ip: Option<String>,
    public_ip_id: Option<String>,
}

struct CreatedVm {
    body: Value,
    nics: Vec<NicRef>,
}

pub struct VmOrchestrator {
    client: Arc<ArmClient>,
    lock_backend: Arc<dyn LockBackend>,
    resolver: Arc<dyn StemcellResolver>,
    config: OrchestratorConfig,
}

impl VmOrchestrator {
    pub fn new(
        client: Arc<ArmClient>,
        lock_backend: Arc<dyn LockBackend>,
        resolver: Arc<dyn StemcellResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            lock_backend,
            resolver,
            config,
        }
    }

    /// Create a VM and all of its sub-resources as one transaction.
    pub async fn create(&self, spec: &VmSpec) -> Result<(InstanceId, Value)> {
        spec.validate()?;
        let rg = self.resource_group_for(spec);
        self.ensure_resource_group(&rg).await?;

        let record = Mutex::new(TransactionRecord::default());

        let outcome = match &spec.props.availability_set {
            Some(availability_set) => {
                // Hold the set's read lock across resolution and the VM
                // submission so a concurrent delete cannot remove it
                // mid-creation; parallel creations into the same set share
                // the lock. Provisioning routinely outlives the lock TTL,
                // so the held entry is renewed alongside the work.
                let lock = self.availability_set_lock(availability_set);
                lock.acquire_read().await?;

                let outcome = tokio::select! {
                    outcome = async {
                        self.ensure_availability_set(&rg, availability_set).await?;
                        self.create_with_retries(&rg, spec, &record).await
                    } => outcome,
                    renewal_err = renew_read_until_failure(&lock, self.lock_renew_interval()) => {
                        Err(renewal_err)
                    }
                };

                // Released on success and on terminal failure alike.
                match (outcome, lock.release_read().await) {
                    (Ok(created), Ok(())) => Ok(created),
                    (Ok(_), Err(release_err)) => Err(CpiError::Lock(release_err)),
                    (Err(err), Ok(())) => Err(err),
                    (Err(err), Err(release_err)) => {
                        // The create failure is the primary error; the
                        // release failure already set the dirty marker.
                        tracing::warn!(
                            lock = %lock.name(),
                            error = %release_err,
                            "Read-lock release failed while handling a create failure"
                        );
                        Err(err)
                    }
                }
            }
            None => self.create_with_retries(&rg, spec, &record).await,
        };

        match outcome {
            Ok(created) => {
                let instance_id = InstanceId::new(
                    &rg,
                    &spec.name,
                    spec.props.caching,
                    spec.props.storage_account.clone(),
                );
                tracing::info!(vm = %spec.name, id = %instance_id, "VM created");
                Ok((instance_id, observed_params(spec, &created)))
            }
            Err(source) => {
                let record = record.into_inner().unwrap_or_default();
                Err(self.fail_create(&rg, spec, record, source).await)
            }
        }
    }

    /// Delete a VM and its sub-resources; idempotent when already absent.
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let rg = id.resource_group.clone();
        let vm_path = self.vm_path(&rg, &id.vm_name);
        let vm_body = self.client.get(&vm_path).await?;

        let (nic_names, availability_set) = match &vm_body {
            Some(body) => {
                let nics = body
                    .pointer("/properties/networkProfile/networkInterfaces")
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(|nic| nic.get("id").and_then(Value::as_str))
                            .map(last_segment)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let availability_set = body
                    .pointer("/properties/availabilitySet/id")
                    .and_then(Value::as_str)
                    .map(last_segment);
                (nics, availability_set)
            }
            // VM already absent: fall back to the naming convention. The
            // availability set cannot be derived, so it is left for the
            // next delete that still sees the VM.
            None => (
                (0..MAX_NICS_PER_VM)
                    .map(|index| nic_name(&id.vm_name, index))
                    .collect(),
                None,
            ),
        };

        if vm_body.is_some() {
            tracing::info!(vm = %id.vm_name, "Deleting VM");
            self.client.delete(&vm_path).await?;
        } else {
            tracing::debug!(vm = %id.vm_name, "VM already absent, cleaning up by convention");
        }

        let network_cleanup = async {
            for nic in &nic_names {
                self.client.delete(&self.nic_path(&rg, nic)).await?;
            }
            self.client
                .delete(&self.public_ip_path(&rg, &pip_name(&id.vm_name)))
                .await?;
            Ok::<_, CpiError>(())
        };
        let disk_cleanup = async {
            self.client
                .delete(&self.disk_path(&rg, &os_disk_name(&id.vm_name)))
                .await?;
            self.client
                .delete(&self.disk_path(&rg, &ephemeral_disk_name(&id.vm_name)))
                .await?;
            Ok::<_, CpiError>(())
        };
        let set_cleanup = async {
            match &availability_set {
                Some(name) => self.delete_availability_set_if_idle(&rg, name).await,
                None => Ok(()),
            }
        };

        tokio::try_join!(network_cleanup, disk_cleanup, set_cleanup)?;
        Ok(())
    }

    /// Attach a managed disk at the lowest free lun above the ephemeral
    /// slot. Returns the lun.
    pub async fn attach_disk(&self, instance_id: &str, disk_id: &str) -> Result<u64> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let disk = DiskId::parse(disk_id, self.default_resource_group())?;

        let vm_path = self.vm_path(&id.resource_group, &id.vm_name);
        let mut body = self
            .client
            .get(&vm_path)
            .await?
            .ok_or_else(|| CpiError::VmNotFound(id.vm_name.clone()))?;

        let disks = data_disks_mut(&mut body);

        if let Some(existing) = disks.iter().find(|d| d["name"] == disk.disk_name.as_str()) {
            // The platform body is the only source of truth for the slot of
            // an already-attached disk; a missing lun is a malformed answer,
            // never something to guess.
            let lun = existing["lun"].as_u64().ok_or_else(|| {
                ArmError::MalformedResponse {
                    url: self.client.url(&vm_path),
                    reason: format!("attached disk {:?} carries no lun", disk.disk_name),
                }
            })?;
            tracing::debug!(vm = %id.vm_name, disk = %disk.disk_name, lun, "Disk already attached");
            return Ok(lun);
        }

        let used: HashSet<u64> = disks.iter().filter_map(|d| d["lun"].as_u64()).collect();
        let lun = lowest_free_lun(&used, self.config.max_data_disks).ok_or_else(|| {
            CpiError::DiskSlotsExhausted {
                vm: id.vm_name.clone(),
                max: self.config.max_data_disks,
            }
        })?;

        let managed_disk_id = self
            .disk_path(&disk.resource_group, &disk.disk_name)
            .relative();
        disks.push(json!({
            "lun": lun,
            "name": disk.disk_name,
            "createOption": "Attach",
            "caching": disk.caching.to_string(),
            "managedDisk": { "id": managed_disk_id }
        }));

        self.client.put(&vm_path, body).await?;
        tracing::info!(vm = %id.vm_name, disk = %disk.disk_name, lun, "Disk attached");
        Ok(lun)
    }

    /// Detach a managed disk; detaching a disk that is not attached is a
    /// no-op.
    pub async fn detach_disk(&self, instance_id: &str, disk_id: &str) -> Result<()> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let disk = DiskId::parse(disk_id, self.default_resource_group())?;

        let vm_path = self.vm_path(&id.resource_group, &id.vm_name);
        let mut body = self
            .client
            .get(&vm_path)
            .await?
            .ok_or_else(|| CpiError::VmNotFound(id.vm_name.clone()))?;

        let disks = data_disks_mut(&mut body);
        let before = disks.len();
        disks.retain(|d| d["name"] != disk.disk_name.as_str());

        if disks.len() == before {
            tracing::warn!(vm = %id.vm_name, disk = %disk.disk_name, "Disk was not attached");
            return Ok(());
        }

        self.client.put(&vm_path, body).await?;
        tracing::info!(vm = %id.vm_name, disk = %disk.disk_name, "Disk detached");
        Ok(())
    }

    pub async fn reboot(&self, instance_id: &str) -> Result<()> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let vm_path = self.vm_path(&id.resource_group, &id.vm_name);

        if self.client.get(&vm_path).await?.is_none() {
            return Err(CpiError::VmNotFound(id.vm_name));
        }
        self.client.post_action(&vm_path, "restart", None).await?;
        tracing::info!(vm = %id.vm_name, "VM restarted");
        Ok(())
    }

    /// Merge the given tags into the VM's tags.
    pub async fn set_tags(
        &self,
        instance_id: &str,
        tags: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let vm_path = self.vm_path(&id.resource_group, &id.vm_name);

        let mut body = self
            .client
            .get(&vm_path)
            .await?
            .ok_or_else(|| CpiError::VmNotFound(id.vm_name.clone()))?;

        if !body["tags"].is_object() {
            body["tags"] = json!({});
        }
        let existing = body["tags"].as_object_mut().unwrap();
        for (key, value) in tags {
            existing.insert(key.clone(), json!(value));
        }

        self.client.put(&vm_path, body).await?;
        Ok(())
    }

    pub async fn has_vm(&self, instance_id: &str) -> Result<bool> {
        let id = InstanceId::parse(instance_id, self.default_resource_group())?;
        let vm_path = self.vm_path(&id.resource_group, &id.vm_name);
        Ok(self.client.get(&vm_path).await?.is_some())
    }

    /// Create an empty managed disk; the generated name makes concurrent
    /// creations collision-free.
    pub async fn create_disk(&self, props: &DiskProps) -> Result<DiskId> {
        props.validate()?;
        let rg = self.default_resource_group().to_string();
        self.ensure_resource_group(&rg).await?;

        let name = format!("disk-{}", uuid::Uuid::new_v4());
        self.client
            .put(
                &self.disk_path(&rg, &name),
                json!({
                    "location": self.location(),
                    "sku": { "name": "Standard_LRS" },
                    "properties": {
                        "creationData": { "createOption": "Empty" },
                        "diskSizeGB": props.size_gb
                    }
                }),
            )
            .await?;

        tracing::info!(disk = %name, size_gb = props.size_gb, "Disk created");
        Ok(DiskId::new(rg, name, props.caching))
    }

    /// Delete a managed disk; deleting an absent disk is a no-op.
    pub async fn delete_disk(&self, disk_id: &str) -> Result<()> {
        let disk = DiskId::parse(disk_id, self.default_resource_group())?;
        self.client
            .delete(&self.disk_path(&disk.resource_group, &disk.disk_name))
            .await?;
        tracing::info!(disk = %disk.disk_name, "Disk deleted");
        Ok(())
    }

    pub async fn has_disk(&self, disk_id: &str) -> Result<bool> {
        let disk = DiskId::parse(disk_id, self.default_resource_group())?;
        let path = self.disk_path(&disk.resource_group, &disk.disk_name);
        Ok(self.client.get(&path).await?.is_some())
    }

    // ---- create internals ----

    async fn create_with_retries(
        &self,
        rg: &str,
        spec: &VmSpec,
        record: &Mutex<TransactionRecord>,
    ) -> Result<CreatedVm> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.provision_attempt(rg, spec, record).await {
                Ok(created) => return Ok(created),
                Err(CpiError::Arm(err))
                    if err.is_provisioning_failure() && attempt <= self.config.create_retries =>
                {
                    tracing::warn!(
                        vm = %spec.name,
                        attempt,
                        error = %err,
                        "Provisioning failed, retrying the provisioning sequence"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One pass over steps 3-5: concurrent sub-resource provisioning, image
    /// resolution, then the VM submission.
    async fn provision_attempt(
        &self,
        rg: &str,
        spec: &VmSpec,
        record: &Mutex<TransactionRecord>,
    ) -> Result<CreatedVm> {
        let nics = async {
            let mut refs = Vec::with_capacity(spec.networks.len());
            for (index, network) in spec.networks.iter().enumerate() {
                refs.push(
                    self.create_network_interface(rg, spec, index, network, record)
                        .await?,
                );
            }
            Ok::<_, CpiError>(refs)
        };
        let diagnostics = async {
            if spec.props.diagnostics {
                Ok(Some(self.ensure_diagnostics_endpoint(rg).await?))
            } else {
                Ok(None)
            }
        };
        let image = self.resolver.resolve(&spec.stemcell_cid);

        let (nic_refs, diagnostics_endpoint, image) = tokio::try_join!(nics, diagnostics, image)?;

        {
            let mut record = record.lock().unwrap();
            record.push(ResourceKind::Vm, spec.name.clone());
            record.push(ResourceKind::Disk, os_disk_name(&spec.name));
            if spec.props.ephemeral_disk_gb.is_some() {
                record.push(ResourceKind::Disk, ephemeral_disk_name(&spec.name));
            }
        }

        let vm_path = self.vm_path(rg, &spec.name);
        let body = self.vm_body(rg, spec, &nic_refs, diagnostics_endpoint.as_deref(), &image);
        let vm = self.client.put(&vm_path, body).await?;

        Ok(CreatedVm {
            body: vm.unwrap_or(Value::Null),
            nics: nic_refs,
        })
    }

    async fn create_network_interface(
        &self,
        rg: &str,
        spec: &VmSpec,
        index: usize,
        network: &NetworkProps,
        record: &Mutex<TransactionRecord>,
    ) -> Result<NicRef> {
        let mut ip_properties = json!({
            "subnet": { "id": network.subnet_id },
            "privateIPAllocationMethod":
                if network.private_ip.is_some() { "Static" } else { "Dynamic" },
        });
        if let Some(ip) = &network.private_ip {
            ip_properties["privateIPAddress"] = json!(ip);
        }

        let mut public_ip_id = None;
        if network.public_ip {
            let pip = pip_name(&spec.name);
            record
                .lock()
                .unwrap()
                .push(ResourceKind::PublicIp, pip.clone());
            let pip_path = self.public_ip_path(rg, &pip);
            self.client
                .put(
                    &pip_path,
                    json!({
                        "location": self.location(),
                        "properties": { "publicIPAllocationMethod": "Dynamic" }
                    }),
                )
                .await?;
            let pip_id = pip_path.relative();
            ip_properties["publicIPAddress"] = json!({ "id": pip_id.clone() });
            public_ip_id = Some(pip_id);
        }

        if let Some(pool) = &network.load_balancer_pool_id {
            ip_properties["loadBalancerBackendAddressPools"] = json!([{ "id": pool }]);
        }

        let nic = nic_name(&spec.name, index);
        record.lock().unwrap().push(ResourceKind::Nic, nic.clone());
        let nic_path = self.nic_path(rg, &nic);
        let nic_body = self
            .client
            .put(
                &nic_path,
                json!({
                    "location": self.location(),
                    "properties": {
                        "ipConfigurations": [
                            { "name": "primary", "properties": ip_properties }
                        ]
                    }
                }),
            )
            .await?;

        let private_ip = nic_body
            .as_ref()
            .and_then(|b| {
                b.pointer("/properties/ipConfigurations/0/properties/privateIPAddress")
            })
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(NicRef {
            id: nic_path.relative(),
            private_ip,
            public_ip_id,
        })
    }

    /// Create-if-missing of the shared diagnostics account, serialized
    /// across processes by a plain lock keyed on the account name.
    async fn ensure_diagnostics_endpoint(&self, rg: &str) -> Result<String> {
        let account = diagnostics_account_name(rg);
        let mut lock = FileLock::new(
            self.lock_backend.clone(),
            format!("storage-{account}"),
            self.lock_ttl(),
        )
        .with_poll_interval(self.lock_poll());

        loop {
            if lock.acquire().await? {
                break;
            }
            lock.wait().await?;
        }

        // Account creation can outlive the lock TTL; keep the entry fresh.
        let result = tokio::select! {
            result = async {
                let path = self.storage_path(rg, &account);
                let body = match self.client.get(&path).await? {
                    Some(body) => body,
                    None => {
                        tracing::info!(%account, "Creating diagnostics storage account");
                        self.client
                            .put(
                                &path,
                                json!({
                                    "location": self.location(),
                                    "sku": { "name": "Standard_LRS" },
                                    "kind": "StorageV2"
                                }),
                            )
                            .await?
                            .unwrap_or(Value::Null)
                    }
                };
                let endpoint = body
                    .pointer("/properties/primaryEndpoints/blob")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("https://{account}.blob.core.windows.net/"));
                Ok::<_, CpiError>(endpoint)
            } => result,
            renewal_err = renew_until_failure(&lock, self.lock_renew_interval()) => {
                Err(renewal_err)
            }
        };

        let released = lock.release().await;
        let endpoint = result?;
        released?;
        Ok(endpoint)
    }

    /// Resolve or create the availability set. Callers hold its read lock.
    async fn ensure_availability_set(&self, rg: &str, name: &str) -> Result<()> {
        let path = self.availability_set_path(rg, name);
        if self.client.get(&path).await?.is_some() {
            return Ok(());
        }

        tracing::info!(availability_set = %name, "Creating availability set");
        let body = json!({
            "location": self.location(),
            "sku": { "name": "Aligned" },
            "properties": {
                "platformFaultDomainCount": 2,
                "platformUpdateDomainCount": 5
            }
        });
        match self.client.put(&path, body).await {
            Ok(_) => Ok(()),
            // Raced another creator; the set exists, which is all we need.
            Err(ArmError::Conflict(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_resource_group(&self, rg: &str) -> Result<()> {
        let url = ResourcePath::resource_group_url(
            self.client.config().management_base(),
            &self.client.config().subscription_id,
            rg,
            &self.client.config().api_version,
        );
        if self.client.get_url(&url).await?.is_none() {
            tracing::info!(resource_group = %rg, "Creating resource group");
            self.client
                .put_url(&url, json!({ "location": self.location() }))
                .await?;
        }
        Ok(())
    }

    /// Wrap a terminal create failure, keeping or rolling back leftovers
    /// according to policy.
    async fn fail_create(
        &self,
        rg: &str,
        spec: &VmSpec,
        record: TransactionRecord,
        source: CpiError,
    ) -> CpiError {
        tracing::error!(vm = %spec.name, error = %source, "VM creation failed");

        if self.config.keep_failed_vms {
            return CpiError::VmCreationFailed {
                vm_name: spec.name.clone(),
                leftovers: record.names(),
                source: Box::new(source),
                cleanup_failure: None,
            };
        }

        match self.rollback(rg, spec, &record).await {
            Ok(()) => CpiError::VmCreationFailed {
                vm_name: spec.name.clone(),
                leftovers: Vec::new(),
                source: Box::new(source),
                cleanup_failure: None,
            },
            Err(cleanup_err) => CpiError::VmCreationFailed {
                vm_name: spec.name.clone(),
                leftovers: record.names(),
                source: Box::new(source),
                cleanup_failure: Some(cleanup_err.to_string()),
            },
        }
    }

    /// Best-effort compensating cleanup in reverse dependency order. Keeps
    /// going past individual failures and reports the first one.
    async fn rollback(&self, rg: &str, spec: &VmSpec, record: &TransactionRecord) -> Result<()> {
        tracing::warn!(vm = %spec.name, "Rolling back partially created resources");
        let mut first_failure: Option<CpiError> = None;

        for name in record.of_kind(ResourceKind::Vm) {
            self.try_delete(&self.vm_path(rg, &name), &mut first_failure)
                .await;
        }
        for name in record.of_kind(ResourceKind::Disk) {
            self.try_delete(&self.disk_path(rg, &name), &mut first_failure)
                .await;
        }
        for name in record.of_kind(ResourceKind::Nic) {
            self.try_delete(&self.nic_path(rg, &name), &mut first_failure)
                .await;
        }
        for name in record.of_kind(ResourceKind::PublicIp) {
            self.try_delete(&self.public_ip_path(rg, &name), &mut first_failure)
                .await;
        }

        if let Some(availability_set) = &spec.props.availability_set
            && let Err(err) = self.delete_availability_set_if_idle(rg, availability_set).await
            && first_failure.is_none()
        {
            first_failure = Some(err);
        }

        match first_failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn try_delete(&self, path: &ResourcePath, first_failure: &mut Option<CpiError>) {
        if let Err(err) = self.client.delete(path).await {
            tracing::warn!(resource = %path, error = %err, "Cleanup delete failed");
            if first_failure.is_none() {
                *first_failure = Some(err.into());
            }
        }
    }

    /// Delete the availability set when no VM references it. Requires the
    /// write lock; a refusal (readers active) skips the delete rather than
    /// waiting.
    async fn delete_availability_set_if_idle(&self, rg: &str, name: &str) -> Result<()> {
        let lock = self.availability_set_lock(name);
        if !lock.acquire_write().await? {
            tracing::debug!(availability_set = %name, "Set busy, skipping delete");
            return Ok(());
        }

        let result = async {
            let path = self.availability_set_path(rg, name);
            if let Some(body) = self.client.get(&path).await? {
                let members = body
                    .pointer("/properties/virtualMachines")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(0);
                if members == 0 {
                    tracing::info!(availability_set = %name, "Deleting empty availability set");
                    self.client.delete(&path).await?;
                }
            }
            Ok::<_, CpiError>(())
        }
        .await;

        let released = lock.release_write().await;
        result?;
        released?;
        Ok(())
    }

    fn vm_body(
        &self,
        rg: &str,
        spec: &VmSpec,
        nics: &[NicRef],
        diagnostics_endpoint: Option<&str>,
        image: &crate::props::StemcellRef,
    ) -> Value {
        let network_interfaces: Vec<Value> = nics
            .iter()
            .enumerate()
            .map(|(index, nic)| {
                json!({ "id": nic.id, "properties": { "primary": index == 0 } })
            })
            .collect();

        let mut data_disks = Vec::new();
        if let Some(size_gb) = spec.props.ephemeral_disk_gb {
            data_disks.push(json!({
                "lun": EPHEMERAL_LUN,
                "name": ephemeral_disk_name(&spec.name),
                "createOption": "Empty",
                "diskSizeGB": size_gb,
                "caching": spec.props.caching.to_string()
            }));
        }

        let mut properties = json!({
            "hardwareProfile": { "vmSize": spec.props.size },
            "storageProfile": {
                "osDisk": {
                    "name": os_disk_name(&spec.name),
                    "createOption": "FromImage",
                    "diskSizeGB": spec.props.os_disk_gb,
                    "caching": spec.props.caching.to_string()
                },
                "imageReference": { "id": image.uri },
                "dataDisks": data_disks
            },
            "networkProfile": { "networkInterfaces": network_interfaces }
        });

        if let Some(availability_set) = &spec.props.availability_set {
            properties["availabilitySet"] =
                json!({ "id": self.availability_set_path(rg, availability_set).relative() });
        }
        if let Some(endpoint) = diagnostics_endpoint {
            properties["diagnosticsProfile"] = json!({
                "bootDiagnostics": { "enabled": true, "storageUri": endpoint }
            });
        }

        json!({
            "location": self.location(),
            "tags": spec.props.tags,
            "properties": properties
        })
    }

    // ---- paths, locks, config accessors ----

    fn resource_group_for(&self, spec: &VmSpec) -> String {
        spec.props
            .resource_group
            .clone()
            .unwrap_or_else(|| self.default_resource_group().to_string())
    }

    fn default_resource_group(&self) -> &str {
        &self.client.config().default_resource_group
    }

    fn location(&self) -> &str {
        &self.client.config().location
    }

    fn subscription(&self) -> &str {
        &self.client.config().subscription_id
    }

    fn vm_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_COMPUTE, "virtualMachines", name)
    }

    fn disk_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_COMPUTE, "disks", name)
    }

    fn availability_set_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_COMPUTE, "availabilitySets", name)
    }

    fn nic_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_NETWORK, "networkInterfaces", name)
    }

    fn public_ip_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_NETWORK, "publicIPAddresses", name)
    }

    fn storage_path(&self, rg: &str, name: &str) -> ResourcePath {
        ResourcePath::new(self.subscription(), rg, PROVIDER_STORAGE, "storageAccounts", name)
    }

    fn availability_set_lock(&self, name: &str) -> ReadersWriterLock {
        ReadersWriterLock::new(
            self.lock_backend.clone(),
            format!("availset-{name}"),
            self.lock_ttl(),
        )
        .with_poll_interval(self.lock_poll())
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl_secs)
    }

    /// Held locks are renewed well within one TTL.
    fn lock_renew_interval(&self) -> Duration {
        (self.lock_ttl() / 3).max(Duration::from_millis(10))
    }

    fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.config.lock_poll_ms)
    }
}

/// Renew a held reader section at a fixed interval. Only resolves on a
/// renewal failure; raced in a `select!` against the protected work, which
/// wins on completion.
async fn renew_read_until_failure(lock: &ReadersWriterLock, interval: Duration) -> CpiError {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = lock.renew_read().await {
            tracing::error!(lock = %lock.name(), error = %err, "Lock renewal failed");
            return err.into();
        }
    }
}

/// [`renew_read_until_failure`] for a plain exclusive lock.
async fn renew_until_failure(lock: &FileLock, interval: Duration) -> CpiError {
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = lock.renew().await {
            tracing::error!(lock = %lock.name(), error = %err, "Lock renewal failed");
            return err.into();
        }
    }
}

fn data_disks_mut(body: &mut Value) -> &mut Vec<Value> {
    let storage_profile = &mut body["properties"]["storageProfile"];
    if !storage_profile["dataDisks"].is_array() {
        storage_profile["dataDisks"] = json!([]);
    }
    storage_profile["dataDisks"].as_array_mut().unwrap()
}

fn observed_params(spec: &VmSpec, created: &CreatedVm) -> Value {
    json!({
        "name": spec.name,
        "availability_set": spec.props.availability_set,
        "private_ips": created
            .nics
            .iter()
            .filter_map(|nic| nic.private_ip.as_deref())
            .collect::<Vec<_>>(),
        "public_ip_ids": created
            .nics
            .iter()
            .filter_map(|nic| nic.public_ip_id.as_deref())
            .collect::<Vec<_>>(),
        "vm": created.body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_convention() {
        assert_eq!(nic_name("vm-1", 0), "vm-1-nic-0");
        assert_eq!(pip_name("vm-1"), "vm-1-pip");
        assert_eq!(os_disk_name("vm-1"), "vm-1-os");
        assert_eq!(ephemeral_disk_name("vm-1"), "vm-1-ephemeral");
    }

    #[test]
    fn test_diagnostics_account_name_is_storage_safe() {
        let name = diagnostics_account_name("My-Resource_Group-With-A-Long-Name");
        assert!(name.len() <= 24);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(name.ends_with("diag"));
    }

    #[test]
    fn test_lun_allocation_skips_ephemeral_slot() {
        assert_eq!(lowest_free_lun(&HashSet::new(), 64), Some(1));
        assert_eq!(lowest_free_lun(&HashSet::from([1, 2]), 64), Some(3));
        assert_eq!(lowest_free_lun(&HashSet::from([1, 3]), 64), Some(2));
    }

    #[test]
    fn test_lun_allocation_exhaustion() {
        let used: HashSet<u64> = (1..64).collect();
        assert_eq!(lowest_free_lun(&used, 64), None);
    }

    #[test]
    fn test_transaction_record_dedup() {
        let mut record = TransactionRecord::default();
        record.push(ResourceKind::Nic, "vm-1-nic-0".to_string());
        record.push(ResourceKind::Nic, "vm-1-nic-0".to_string());
        record.push(ResourceKind::Vm, "vm-1".to_string());
        assert_eq!(record.names(), vec!["vm-1-nic-0", "vm-1"]);
        assert_eq!(record.of_kind(ResourceKind::Nic), vec!["vm-1-nic-0"]);
    }
}
