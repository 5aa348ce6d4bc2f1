#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;
use tempfile::TempDir;

use dl_app::{
    DeviceManager, DeviceManagerDeps, DeviceManagerOptions, EnsureError, StateHandle, TaskRunner,
};
use dl_core::device::SerialAssertion;
use dl_core::encryption::{
    EncryptionBackend, EncryptionKey, EncryptionSetupData, KeysForRoles, StorageRole,
};
use dl_core::model::Grade;
use dl_core::ports::{
    AssertionDbPort, AssertionError, BootError, BootPort, ClockPort, CloudInitError,
    CloudInitPort, CloudInitRestriction, DeviceServiceError, DeviceServicePort, HookError,
    HookOutput, HookRequest, HookRunnerPort, InstallError, InstallOptions, InstallPort,
    InstalledSystem, KeyPairError, KeyPairPort, MakeRunnableRequest, PlannerError,
    RemodelContext, RemodelPlannerPort, RestartError, RestartKind, RestartPort, SaveContents,
    SecbootError, SecbootPort, SerialResponse, StateStorePort, TargetConfig, TryRecoveryOutcome,
};
use dl_core::seed::{GadgetInfo, SeedSnap, SnapKind};
use dl_core::snap::SnapSetup;
use dl_core::state::keys;
use dl_core::{
    Change, ChangeId, DeviceState, ModelAssertion, RemodelKind, State, Status, SystemMode,
    SystemModeInfo, Task,
};
use dl_infra::FsSeed;

pub const LABEL: &str = "20240101";
/// 2023-11-14T22:13:20Z
pub const START_MS: i64 = 1_700_000_000_000;

pub fn model(grade: Grade) -> ModelAssertion {
    ModelAssertion {
        brand_id: "canonical".into(),
        model: "pc".into(),
        revision: 1,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        grade,
        storage_safety: None,
        gadget: Some("pc".into()),
        kernel: Some("pc-kernel".into()),
        base: Some("core24".into()),
        store: None,
        required_snaps: vec![],
        validation_sets: vec![],
        classic: false,
    }
}

pub fn mode(mode: SystemMode) -> SystemModeInfo {
    SystemModeInfo {
        mode,
        recovery_system: Some(LABEL.into()),
        boot_flags: vec![],
        has_mode_record: true,
    }
}

pub fn serial(serial: &str, model: &str, key_id: &str) -> SerialAssertion {
    SerialAssertion {
        brand_id: "canonical".into(),
        model: model.into(),
        serial: serial.into(),
        device_key_id: key_id.into(),
        encoded: format!("serial {serial}"),
    }
}

/// Writes a seed system in the layout read by [`FsSeed`]. Every snap file
/// lands in the shared snaps directory.
pub fn write_seed_system(seed: &Path, label: &str, model: &ModelAssertion) {
    let snaps_dir = seed.join("snaps");
    let system_dir = seed.join("systems").join(label);
    std::fs::create_dir_all(&snaps_dir).unwrap();
    std::fs::create_dir_all(&system_dir).unwrap();

    let layout = [
        ("snapd", SnapKind::Snapd, true),
        ("core24", SnapKind::Base, true),
        ("pc-kernel", SnapKind::Kernel, true),
        ("pc", SnapKind::Gadget, true),
        ("hello", SnapKind::App, false),
    ];
    let snaps: Vec<SeedSnap> = layout
        .iter()
        .map(|(name, kind, essential)| {
            let path = snaps_dir.join(format!("{name}_1.snap"));
            std::fs::write(&path, format!("{name} revision 1")).unwrap();
            SeedSnap {
                name: name.to_string(),
                revision: "1".into(),
                path,
                kind: *kind,
                essential: *essential,
            }
        })
        .collect();
    let gadget = GadgetInfo {
        roles: vec![
            StorageRole::SystemSeed,
            StorageRole::SystemBoot,
            StorageRole::SystemData,
            StorageRole::SystemSave,
        ],
    };

    std::fs::write(
        system_dir.join("snaps.json"),
        serde_json::to_string_pretty(&snaps).unwrap(),
    )
    .unwrap();
    std::fs::write(
        system_dir.join("gadget.json"),
        serde_json::to_string_pretty(&gadget).unwrap(),
    )
    .unwrap();
    std::fs::write(
        system_dir.join("model.json"),
        serde_json::to_string_pretty(model).unwrap(),
    )
    .unwrap();
}

#[derive(Default)]
pub struct MemoryStore {
    saved: StdMutex<Option<State>>,
}

#[async_trait]
impl StateStorePort for MemoryStore {
    async fn load(&self) -> anyhow::Result<State> {
        Ok(self.saved.lock().unwrap().clone().unwrap_or_default())
    }

    async fn save(&self, state: &State) -> anyhow::Result<()> {
        *self.saved.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBoot {
    pub calls: StdMutex<Vec<String>>,
    pub good: StdMutex<Vec<String>>,
    pub try_outcome: StdMutex<Option<TryRecoveryOutcome>>,
    pub runnable: StdMutex<Vec<MakeRunnableRequest>>,
    pub fail_promote: AtomicBool,
}

impl FakeBoot {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }
}

#[async_trait]
impl BootPort for FakeBoot {
    async fn mode_info(&self) -> Result<SystemModeInfo, BootError> {
        Err(BootError::Unavailable("no modeenv".into()))
    }

    async fn make_runnable(
        &self,
        request: &MakeRunnableRequest,
        _keys: Option<&KeysForRoles>,
    ) -> Result<(), BootError> {
        self.record(format!("make-runnable:{}", request.recovery_system));
        self.runnable.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn ensure_next_boot_to_run_mode(&self, recovery_system: &str) -> Result<(), BootError> {
        self.record(format!("next-boot-run:{recovery_system}"));
        Ok(())
    }

    async fn set_try_recovery_system(&self, label: &str) -> Result<(), BootError> {
        self.record(format!("try:{label}"));
        Ok(())
    }

    async fn set_recovery_boot_system_and_mode(
        &self,
        label: &str,
        mode: &str,
    ) -> Result<(), BootError> {
        self.record(format!("{mode}:{label}"));
        Ok(())
    }

    async fn promote_tried_recovery_system(
        &self,
        label: &str,
        _tried: &[String],
    ) -> Result<(), BootError> {
        self.record(format!("promote:{label}"));
        if self.fail_promote.load(Ordering::SeqCst) {
            return Err(BootError::Failed("cannot write boot variables".into()));
        }
        Ok(())
    }

    async fn drop_recovery_system(&self, label: &str) -> Result<(), BootError> {
        self.record(format!("drop:{label}"));
        self.good.lock().unwrap().retain(|l| l != label);
        Ok(())
    }

    async fn mark_recovery_capable(&self, label: &str) -> Result<(), BootError> {
        self.record(format!("capable:{label}"));
        let mut good = self.good.lock().unwrap();
        if !good.iter().any(|l| l == label) {
            good.push(label.to_string());
        }
        Ok(())
    }

    async fn unmark_recovery_capable(&self, label: &str) -> Result<(), BootError> {
        self.record(format!("uncapable:{label}"));
        self.good.lock().unwrap().retain(|l| l != label);
        Ok(())
    }

    async fn good_recovery_systems(&self) -> Result<Vec<String>, BootError> {
        Ok(self.good.lock().unwrap().clone())
    }

    async fn mark_boot_successful(&self) -> Result<(), BootError> {
        self.record("boot-ok".into());
        Ok(())
    }

    async fn inspect_try_recovery_outcome(&self) -> Result<Option<TryRecoveryOutcome>, BootError> {
        Ok(self.try_outcome.lock().unwrap().take())
    }

    async fn clear_try_recovery_system(&self, label: &str) -> Result<(), BootError> {
        self.record(format!("clear-try:{label}"));
        Ok(())
    }
}

fn test_keys() -> KeysForRoles {
    [
        (StorageRole::SystemData, EncryptionKey::new(vec![1; 32])),
        (StorageRole::SystemSave, EncryptionKey::new(vec![2; 32])),
    ]
    .into_iter()
    .collect()
}

#[derive(Default)]
pub struct FakeInstall {
    pub runs: StdMutex<Vec<InstallOptions>>,
    pub targets: StdMutex<Vec<TargetConfig>>,
    pub save: StdMutex<SaveContents>,
    pub restored_keys: StdMutex<Vec<String>>,
    pub finished: StdMutex<Vec<(String, Option<EncryptionBackend>)>>,
}

#[async_trait]
impl InstallPort for FakeInstall {
    async fn run(&self, options: &InstallOptions) -> Result<InstalledSystem, InstallError> {
        self.runs.lock().unwrap().push(options.clone());
        Ok(InstalledSystem {
            keys: options.backend.map(|_| test_keys()),
            storage_traits: json!({"sector-size": 512}),
        })
    }

    async fn save_storage_traits(&self, _traits: &serde_json::Value) -> Result<(), InstallError> {
        Ok(())
    }

    async fn restore_preseed_artifact(&self, _recovery_system: &str) -> Result<bool, InstallError> {
        Ok(false)
    }

    async fn write_model_and_clock(&self, _model: &ModelAssertion) -> Result<(), InstallError> {
        Ok(())
    }

    async fn configure_target(&self, config: &TargetConfig) -> Result<(), InstallError> {
        self.targets.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn setup_storage_encryption(
        &self,
        recovery_system: &str,
        backend: EncryptionBackend,
    ) -> Result<EncryptionSetupData, InstallError> {
        Ok(EncryptionSetupData {
            label: recovery_system.to_string(),
            backend,
            keys: test_keys(),
            devices: BTreeMap::new(),
        })
    }

    async fn finish_install(
        &self,
        recovery_system: &str,
        encryption: Option<&EncryptionSetupData>,
    ) -> Result<(), InstallError> {
        self.finished
            .lock()
            .unwrap()
            .push((recovery_system.to_string(), encryption.map(|e| e.backend)));
        Ok(())
    }

    async fn inspect_save(&self) -> Result<SaveContents, InstallError> {
        Ok(self.save.lock().unwrap().clone())
    }

    async fn restore_device_key(&self, key_id: &str) -> Result<(), InstallError> {
        self.restored_keys.lock().unwrap().push(key_id.to_string());
        Ok(())
    }
}

pub struct FakeSecboot {
    pub result: StdMutex<Result<(), SecbootError>>,
    pub calls: AtomicUsize,
}

impl Default for FakeSecboot {
    fn default() -> Self {
        Self {
            result: StdMutex::new(Ok(())),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeSecboot {
    pub fn unavailable(&self, reason: &str) {
        *self.result.lock().unwrap() = Err(SecbootError::Unavailable(reason.into()));
    }
}

#[async_trait]
impl SecbootPort for FakeSecboot {
    async fn check_tpm_sealing_supported(&self) -> Result<(), SecbootError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
pub enum HookReply {
    Output(HookOutput),
    Fail(String),
}

#[derive(Default)]
pub struct FakeHooks {
    hooks: StdMutex<HashMap<(String, String), HookReply>>,
    pub runs: StdMutex<Vec<HookRequest>>,
}

impl FakeHooks {
    pub fn install(&self, snap: &str, hook: &str, reply: HookReply) {
        self.hooks
            .lock()
            .unwrap()
            .insert((snap.to_string(), hook.to_string()), reply);
    }

    pub fn ran(&self, hook: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.hook == hook)
            .count()
    }
}

#[async_trait]
impl HookRunnerPort for FakeHooks {
    async fn has_hook(&self, snap: &str, hook: &str) -> Result<bool, HookError> {
        Ok(self
            .hooks
            .lock()
            .unwrap()
            .contains_key(&(snap.to_string(), hook.to_string())))
    }

    async fn run_hook(
        &self,
        request: &HookRequest,
        _timeout: Duration,
    ) -> Result<HookOutput, HookError> {
        self.runs.lock().unwrap().push(request.clone());
        let reply = self
            .hooks
            .lock()
            .unwrap()
            .get(&(request.snap.clone(), request.hook.clone()))
            .cloned();
        match reply {
            Some(HookReply::Output(output)) => Ok(output),
            Some(HookReply::Fail(message)) => Err(HookError::Failed {
                hook: request.hook.clone(),
                message,
            }),
            None => Err(HookError::Failed {
                hook: request.hook.clone(),
                message: "no such hook".into(),
            }),
        }
    }
}

#[derive(Default)]
pub struct FakeAssertions {
    pub models: StdMutex<Vec<ModelAssertion>>,
    pub serials: StdMutex<Vec<SerialAssertion>>,
    pub reject_models: AtomicBool,
}

#[async_trait]
impl AssertionDbPort for FakeAssertions {
    async fn find_model(
        &self,
        brand_id: &str,
        model: &str,
    ) -> Result<Option<ModelAssertion>, AssertionError> {
        Ok(self
            .models
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.brand_id == brand_id && m.model == model)
            .max_by_key(|m| m.revision)
            .cloned())
    }

    async fn add_model(&self, model: &ModelAssertion) -> Result<(), AssertionError> {
        if self.reject_models.load(Ordering::SeqCst) {
            return Err(AssertionError::Invalid("model signature does not verify".into()));
        }
        let mut models = self.models.lock().unwrap();
        if models.iter().any(|m| {
            m.brand_id == model.brand_id && m.model == model.model && m.revision == model.revision
        }) {
            return Err(AssertionError::SameRevision(model.identity()));
        }
        models.push(model.clone());
        Ok(())
    }

    async fn find_serials(
        &self,
        brand_id: &str,
        model: &str,
        device_key_id: &str,
    ) -> Result<Vec<SerialAssertion>, AssertionError> {
        Ok(self
            .serials
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.matches(brand_id, model, device_key_id))
            .cloned()
            .collect())
    }

    async fn add_serial(&self, serial: &SerialAssertion) -> Result<(), AssertionError> {
        self.serials.lock().unwrap().push(serial.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDeviceService {
    pub responses: StdMutex<VecDeque<Result<SerialResponse, DeviceServiceError>>>,
    pub requests: StdMutex<Vec<String>>,
    pub sessions: StdMutex<Vec<String>>,
    pub request_ids: AtomicUsize,
}

impl FakeDeviceService {
    pub fn reply(&self, response: Result<SerialResponse, DeviceServiceError>) {
        self.responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl DeviceServicePort for FakeDeviceService {
    async fn request_id(&self) -> Result<String, DeviceServiceError> {
        let n = self.request_ids.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("REQ-ID-{n}"))
    }

    async fn submit_serial_request(
        &self,
        request: &str,
    ) -> Result<SerialResponse, DeviceServiceError> {
        self.requests.lock().unwrap().push(request.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(DeviceServiceError::Transient("no reply queued".into())))
    }

    async fn open_store_session(
        &self,
        model: &ModelAssertion,
        _device: &DeviceState,
    ) -> Result<String, DeviceServiceError> {
        self.sessions.lock().unwrap().push(model.identity());
        Ok(format!("session-for-{}", model.model))
    }
}

#[derive(Default)]
pub struct FakeKeyPair {
    pub keys: StdMutex<BTreeSet<String>>,
    generated: AtomicUsize,
}

#[async_trait]
impl KeyPairPort for FakeKeyPair {
    async fn generate(&self) -> Result<String, KeyPairError> {
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        let key_id = format!("device-key-{n}");
        self.keys.lock().unwrap().insert(key_id.clone());
        Ok(key_id)
    }

    async fn exists(&self, key_id: &str) -> Result<bool, KeyPairError> {
        Ok(self.keys.lock().unwrap().contains(key_id))
    }

    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyPairError> {
        if !self.keys.lock().unwrap().contains(key_id) {
            return Err(KeyPairError::NotFound(key_id.into()));
        }
        Ok(vec![7; 32])
    }

    async fn sign(&self, _key_id: &str, _payload: &[u8]) -> Result<Vec<u8>, KeyPairError> {
        Ok(b"signature".to_vec())
    }

    async fn delete(&self, key_id: &str) -> Result<(), KeyPairError> {
        if self.keys.lock().unwrap().remove(key_id) {
            Ok(())
        } else {
            Err(KeyPairError::NotFound(key_id.into()))
        }
    }
}

#[derive(Default)]
pub struct FakeRestart {
    pub requests: StdMutex<Vec<RestartKind>>,
    pending: StdMutex<Option<RestartKind>>,
}

impl FakeRestart {
    /// The requested restart happened.
    pub fn complete(&self) {
        self.pending.lock().unwrap().take();
    }
}

#[async_trait]
impl RestartPort for FakeRestart {
    async fn request_restart(&self, kind: RestartKind) -> Result<(), RestartError> {
        self.requests.lock().unwrap().push(kind);
        *self.pending.lock().unwrap() = Some(kind);
        Ok(())
    }

    fn pending(&self) -> Option<RestartKind> {
        *self.pending.lock().unwrap()
    }
}

pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl ClockPort for FakeClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakePlanner {
    pub plan: StdMutex<Vec<SnapSetup>>,
    pub kinds: StdMutex<Vec<RemodelKind>>,
}

#[async_trait]
impl RemodelPlannerPort for FakePlanner {
    async fn plan(&self, ctx: &RemodelContext) -> Result<Vec<SnapSetup>, PlannerError> {
        self.kinds.lock().unwrap().push(ctx.kind);
        Ok(self.plan.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeCloudInit {
    pub grades: StdMutex<Vec<Grade>>,
}

#[async_trait]
impl CloudInitPort for FakeCloudInit {
    async fn restrict(&self, grade: Grade) -> Result<CloudInitRestriction, CloudInitError> {
        self.grades.lock().unwrap().push(grade);
        Ok(CloudInitRestriction::Restricted)
    }
}

/// Every collaborator of the device manager. Shared across simulated
/// daemon restarts.
pub struct Fakes {
    pub boot: Arc<FakeBoot>,
    pub install: Arc<FakeInstall>,
    pub secboot: Arc<FakeSecboot>,
    pub hooks: Arc<FakeHooks>,
    pub assertions: Arc<FakeAssertions>,
    pub device_service: Arc<FakeDeviceService>,
    pub keypair: Arc<FakeKeyPair>,
    pub restart: Arc<FakeRestart>,
    pub clock: Arc<FakeClock>,
    pub planner: Arc<FakePlanner>,
    pub cloud_init: Arc<FakeCloudInit>,
    pub store: Arc<MemoryStore>,
    pub seed: Arc<FsSeed>,
}

impl Fakes {
    fn new(seed_dir: PathBuf) -> Self {
        Self {
            boot: Arc::default(),
            install: Arc::default(),
            secboot: Arc::default(),
            hooks: Arc::default(),
            assertions: Arc::default(),
            device_service: Arc::default(),
            keypair: Arc::default(),
            restart: Arc::default(),
            clock: Arc::new(FakeClock(AtomicI64::new(START_MS))),
            planner: Arc::default(),
            cloud_init: Arc::default(),
            store: Arc::default(),
            seed: Arc::new(FsSeed::new(seed_dir)),
        }
    }

    fn deps(&self) -> DeviceManagerDeps {
        DeviceManagerDeps {
            boot: self.boot.clone(),
            install: self.install.clone(),
            secboot: self.secboot.clone(),
            seed: self.seed.clone(),
            seed_writer: self.seed.clone(),
            hooks: self.hooks.clone(),
            assertions: self.assertions.clone(),
            device_service: self.device_service.clone(),
            keypair: self.keypair.clone(),
            restart: self.restart.clone(),
            clock: self.clock.clone(),
            planner: self.planner.clone(),
            cloud_init: self.cloud_init.clone(),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub fakes: Fakes,
    pub manager: DeviceManager,
    pub runner: TaskRunner,
}

impl Harness {
    /// A fresh device booted in `mode` from the seed system [`LABEL`]
    /// carrying `model`.
    pub fn new(mode: SystemModeInfo, model: &ModelAssertion) -> Self {
        Self::with_options(mode, model, DeviceManagerOptions::default())
    }

    pub fn with_options(
        mode: SystemModeInfo,
        model: &ModelAssertion,
        options: DeviceManagerOptions,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let seed_dir = dir.path().join("seed");
        write_seed_system(&seed_dir, LABEL, model);
        let fakes = Fakes::new(seed_dir);
        let state = StateHandle::new(State::default(), fakes.store.clone());
        Self::assemble(dir, fakes, state, mode, options)
    }

    fn assemble(
        dir: TempDir,
        fakes: Fakes,
        state: StateHandle,
        mode: SystemModeInfo,
        options: DeviceManagerOptions,
    ) -> Self {
        let manager = DeviceManager::from_deps(fakes.deps(), state.clone(), mode, options);
        let mut runner = TaskRunner::new(state, fakes.clock.clone(), fakes.restart.clone());
        manager.register_handlers(&mut runner);
        Self {
            dir,
            fakes,
            manager,
            runner,
        }
    }

    /// A device that finished seeding in run mode.
    pub async fn seeded_run(model: &ModelAssertion) -> Self {
        let h = Self::new(mode(SystemMode::Run), model);
        h.manager.ensure().await.unwrap();
        h.runner.run_pass().await.unwrap();
        assert_eq!(h.get::<bool>(keys::SEEDED).await, Some(true));
        h
    }

    /// Simulates a daemon restart: collaborators and the persisted state
    /// survive, everything held in memory does not.
    pub async fn restart_daemon(self, mode: SystemModeInfo) -> Self {
        let state = StateHandle::load(self.fakes.store.clone()).await.unwrap();
        Self::assemble(
            self.dir,
            self.fakes,
            state,
            mode,
            DeviceManagerOptions::default(),
        )
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.dir.path().join("seed")
    }

    /// One ensure pass followed by one runner pass.
    pub async fn tick(&self) -> Result<(), EnsureError> {
        let ensured = self.manager.ensure().await;
        self.runner.run_pass().await.unwrap();
        ensured
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.manager.state().lock().await.get(key).unwrap()
    }

    pub async fn device(&self) -> DeviceState {
        self.get(keys::DEVICE).await.unwrap_or_default()
    }

    pub async fn changes_of_kind(&self, kind: &str) -> Vec<Change> {
        let st = self.manager.state().lock().await;
        st.graph()
            .changes_of_kind(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn change_tasks(&self, chg: &ChangeId) -> Vec<Task> {
        let st = self.manager.state().lock().await;
        st.graph()
            .change_tasks(chg)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn task_of_kind(&self, chg: &ChangeId, kind: &str) -> Task {
        self.change_tasks(chg)
            .await
            .into_iter()
            .find(|t| t.kind == kind)
            .unwrap_or_else(|| panic!("change {chg} has no {kind} task"))
    }

    pub async fn status_of(&self, chg: &ChangeId, kind: &str) -> Status {
        self.task_of_kind(chg, kind).await.status
    }

    pub async fn change_err(&self, chg: &ChangeId) -> Option<String> {
        self.manager.state().lock().await.graph().change_err(chg)
    }

    pub fn snap_file(&self, name: &str, revision: &str) -> PathBuf {
        self.seed_dir()
            .join("snaps")
            .join(format!("{name}_{revision}.snap"))
    }

    /// A snap file outside the seed, as a remodel or a local snap would
    /// provide it.
    pub fn local_snap(&self, name: &str, revision: &str) -> PathBuf {
        let dir = self.dir.path().join("local");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}_{revision}.snap"));
        std::fs::write(&path, format!("{name} revision {revision}")).unwrap();
        path
    }
}
