//! Device registration: key generation and the serial request protocol.

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use dl_core::device::{SerialAssertion, SerialSetup};
use dl_core::ports::{AssertionError, KeyPairError, SerialResponse};
use dl_core::state::keys;
use dl_core::{DeviceState, SystemMode, TaskId};

use super::hooks::HookSetup;
use super::{device_state, is_seeded, DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

const RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Failed attempts at building and sending a serial request before the
/// device service has acknowledged one.
const MAX_TENTATIVES: u32 = 15;

/// Change kinds that make a classic device without gadget or brand store
/// want to register.
const SNAP_CHANGE_KINDS: [&str; 2] = ["install-snap", "refresh-snap"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnregisterOptions {
    /// Keep the device unregistered until the daemon restarts.
    pub no_registration_until_reboot: bool,
}

impl DeviceManager {
    pub(super) async fn ensure_operational(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Run
            || self.lifecycle.lock().await.no_registration_until_reboot
        {
            return Ok(());
        }
        {
            let st = self.state.lock().await;
            let device = device_state(&st)?;
            if device.is_registered()
                || !is_seeded(&st)?
                || st.graph().live_change_of_kind("become-operational").is_some()
            {
                return Ok(());
            }
        }

        let Some(model) = self.current_model().await? else {
            return Ok(());
        };

        if model.gadget.is_none() && model.store.is_none() {
            let st = self.state.lock().await;
            let wants_snaps = SNAP_CHANGE_KINDS
                .iter()
                .any(|kind| !st.graph().changes_of_kind(kind).is_empty());
            if !wants_snaps {
                return Ok(());
            }
        }

        if !self
            .lifecycle
            .lock()
            .await
            .try_become_operational(self.deps.clock.now_ms())
        {
            return Ok(());
        }

        let prepare_hook = match &model.gadget {
            Some(gadget) => self.deps.hooks.has_hook(gadget, "prepare-device").await?,
            None => false,
        };

        let mut st = self.state.lock().await;
        let g = st.graph_mut();
        let chg = g.new_change("become-operational", "Initialize device");
        let mut ids = Vec::new();
        if let (true, Some(gadget)) = (prepare_hook, &model.gadget) {
            let hook = g.new_task("run-hook", "Run prepare-device hook");
            g.task_mut(&hook)?.set(
                "hook-setup",
                &HookSetup {
                    snap: gadget.clone(),
                    hook: "prepare-device".into(),
                    optional: true,
                },
            )?;
            ids.push(hook);
        }
        ids.push(g.new_task("generate-device-key", "Generate device key"));
        ids.push(g.new_task("request-serial", "Request device serial"));
        for id in &ids {
            g.add_task(&chg, id)?;
        }
        g.chain(&ids)?;

        info!(change = %chg, model = %model.identity(), "created become-operational change");
        Ok(())
    }

    pub(super) async fn do_generate_device_key(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        {
            let st = self.state.lock().await;
            if device_state(&st)?.has_key() {
                return Ok(TaskOutcome::Done);
            }
        }

        let key_id = self
            .deps
            .keypair
            .generate()
            .await
            .map_err(|e| TaskError::failed(format!("cannot generate device key pair: {e}")))?;

        let mut st = self.state.lock().await;
        let mut device = device_state(&st)?;
        device.key_id = key_id.clone();
        st.set(keys::DEVICE, &device)?;
        st.task_mut(task)?
            .logf(format!("Generated device key {key_id}"));
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn do_request_serial(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let (device, mut setup) = {
            let st = self.state.lock().await;
            let setup: SerialSetup = st.task(task)?.get("serial-setup")?.unwrap_or_default();
            (device_state(&st)?, setup)
        };

        let key_present = device.has_key()
            && self
                .deps
                .keypair
                .exists(&device.key_id)
                .await
                .map_err(|e| TaskError::failed(format!("cannot read device key pair: {e}")))?;
        if !key_present {
            return Err(TaskError::Internal("cannot find device key pair".into()));
        }

        // A serial received before a crash but not recorded yet.
        if let Some(serial) = setup.serial.clone() {
            return self.finish_registration(task, &serial).await;
        }

        let known = self
            .deps
            .assertions
            .find_serials(&device.brand, &device.model, &device.key_id)
            .await
            .map_err(TaskError::failed)?;
        match known.as_slice() {
            [] => {}
            [serial] => return self.finish_registration(task, serial).await,
            _ => {
                return Err(TaskError::Internal(
                    "multiple serial assertions for the same device key".into(),
                ))
            }
        }

        let request = if setup.serial_request.is_empty() {
            match self.build_serial_request(&device).await {
                Ok(request) => request,
                Err(err) => return self.retry_before_poll(task, "prepare serial request", err).await,
            }
        } else {
            setup.serial_request.clone()
        };

        // Any failure is retried: before the first acknowledgement a bounded
        // number of times, while polling without limit.
        let response = match self.deps.device_service.submit_serial_request(&request).await {
            Ok(response) => response,
            Err(err) if setup.serial_request.is_empty() => {
                return self
                    .retry_before_poll(task, "deliver device serial request", err.to_string())
                    .await
            }
            Err(err) => {
                self.task_log(
                    task,
                    format!("Cannot poll for device serial assertion, will retry: {err}"),
                )
                .await?;
                return Ok(TaskOutcome::Retry(RETRY_INTERVAL));
            }
        };

        match response {
            SerialResponse::Poll => {
                let mut st = self.state.lock().await;
                setup.serial_request = request;
                let t = st.task_mut(task)?;
                t.set("serial-setup", &setup)?;
                t.logf("Will poll for device serial assertion in 60 seconds");
                Ok(TaskOutcome::Retry(RETRY_INTERVAL))
            }
            SerialResponse::Issued(serial) => {
                if !serial.matches(&device.brand, &device.model, &device.key_id) {
                    return Err(TaskError::failed(format!(
                        "obtained serial assertion does not match provided device identity \
                         information (brand, model, key id): {} / {} / {} != {} / {} / {}",
                        serial.brand_id,
                        serial.model,
                        serial.device_key_id,
                        device.brand,
                        device.model,
                        device.key_id
                    )));
                }
                {
                    let mut st = self.state.lock().await;
                    setup.serial = Some(serial.clone());
                    st.task_mut(task)?.set("serial-setup", &setup)?;
                }
                self.state.checkpoint().await?;
                self.finish_registration(task, &serial).await
            }
        }
    }

    /// Builds a signed serial request: the JSON body, a newline and the hex
    /// encoded signature over the body.
    async fn build_serial_request(&self, device: &DeviceState) -> Result<String, String> {
        let request_id = self
            .deps
            .device_service
            .request_id()
            .await
            .map_err(|e| format!("cannot get request id: {e}"))?;
        let public_key = self
            .deps
            .keypair
            .public_key(&device.key_id)
            .await
            .map_err(|e| e.to_string())?;
        let body = json!({
            "brand-id": device.brand,
            "model": device.model,
            "request-id": request_id,
            "device-key": hex::encode(public_key),
            "device-key-sha3-384": device.key_id,
            "timestamp": self.deps.clock.now().to_rfc3339(),
        })
        .to_string();
        let signature = self
            .deps
            .keypair
            .sign(&device.key_id, body.as_bytes())
            .await
            .map_err(|e| format!("cannot sign serial request: {e}"))?;
        Ok(format!("{body}\n{}", hex::encode(signature)))
    }

    /// Retries a failure that happened before the first poll, up to
    /// [`MAX_TENTATIVES`] times.
    async fn retry_before_poll(
        &self,
        task: &TaskId,
        what: &str,
        err: String,
    ) -> Result<TaskOutcome, TaskError> {
        let mut st = self.state.lock().await;
        let t = st.task_mut(task)?;
        let tentatives = t.get::<u32>("pre-poll-tentatives")?.unwrap_or(0) + 1;
        t.set("pre-poll-tentatives", &tentatives)?;
        if tentatives >= MAX_TENTATIVES {
            return Err(TaskError::failed(format!("cannot {what}: {err}")));
        }
        t.logf(format!("Cannot {what}, will retry in 60 seconds: {err}"));
        warn!(task = %task, tentatives, error = %err, "serial request attempt failed");
        Ok(TaskOutcome::Retry(RETRY_INTERVAL))
    }

    async fn finish_registration(
        &self,
        task: &TaskId,
        serial: &SerialAssertion,
    ) -> Result<TaskOutcome, TaskError> {
        match self.deps.assertions.add_serial(serial).await {
            Ok(()) | Err(AssertionError::SameRevision(_)) => {}
            Err(err) => {
                return Err(TaskError::failed(format!(
                    "cannot add serial assertion: {err}"
                )))
            }
        }

        let mut st = self.state.lock().await;
        let mut device = device_state(&st)?;
        device.serial = serial.serial.clone();
        st.set(keys::DEVICE, &device)?;
        st.task_mut(task)?
            .logf(format!("Device registered with serial {}", serial.serial));
        info!(brand = %device.brand, model = %device.model, serial = %device.serial, "device registered");
        Ok(TaskOutcome::Done)
    }

    /// Forgets the device identity so that registration starts over.
    pub async fn unregister(&self, opts: UnregisterOptions) -> Result<(), DeviceManagerError> {
        let key_id = {
            let mut st = self.state.lock().await;
            let mut device = device_state(&st)?;
            let key_id = std::mem::take(&mut device.key_id);
            device.serial.clear();
            device.session_macaroon.clear();
            st.set(keys::DEVICE, &device)?;
            key_id
        };
        if !key_id.is_empty() {
            match self.deps.keypair.delete(&key_id).await {
                Ok(()) | Err(KeyPairError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.checkpoint().await?;

        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.no_registration_until_reboot = opts.no_registration_until_reboot;
        lifecycle.reset_registration_backoff();
        info!(
            no_registration_until_reboot = opts.no_registration_until_reboot,
            "device unregistered"
        );
        Ok(())
    }
}
