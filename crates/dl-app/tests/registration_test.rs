mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{mode, model, serial, Harness};
use dl_app::UnregisterOptions;
use dl_core::model::Grade;
use dl_core::device::SerialSetup;
use dl_core::ports::{DeviceServiceError, SerialResponse};
use dl_core::{Status, SystemMode};

#[tokio::test]
async fn serial_is_polled_for_until_issued() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes.device_service.reply(Ok(SerialResponse::Poll));
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "pc", "device-key-1"))));

    h.tick().await.unwrap();

    let chg = h.changes_of_kind("become-operational").await[0].id.clone();
    assert_eq!(h.status_of(&chg, "generate-device-key").await, Status::Done);
    let request = h.task_of_kind(&chg, "request-serial").await;
    assert_eq!(request.status, Status::Do);
    assert!(request.has("serial-setup"));
    assert_eq!(h.device().await.key_id, "device-key-1");
    assert!(!h.device().await.is_registered());

    // not due yet
    h.runner.run_pass().await.unwrap();
    assert_eq!(h.fakes.device_service.requests.lock().unwrap().len(), 1);

    h.fakes.clock.advance(Duration::from_secs(60));
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "request-serial").await, Status::Done);
    assert_eq!(h.device().await.serial, "9999");
    let requests = h.fakes.device_service.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert!(requests[0].contains("\"request-id\":\"REQ-ID-1\""));
    assert_eq!(h.fakes.assertions.serials.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn serial_for_another_device_is_rejected() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "other-model", "device-key-1"))));

    h.tick().await.unwrap();

    let chg = h.changes_of_kind("become-operational").await[0].id.clone();
    assert_eq!(h.status_of(&chg, "request-serial").await, Status::Error);
    assert!(h.change_err(&chg).await.unwrap().contains(
        "obtained serial assertion does not match provided device identity information \
         (brand, model, key id): canonical / other-model / device-key-1 != canonical / pc / device-key-1"
    ));
    assert!(!h.device().await.is_registered());
}

#[tokio::test]
async fn known_serial_for_the_key_is_reused() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes
        .assertions
        .serials
        .lock()
        .unwrap()
        .push(serial("1234", "pc", "device-key-1"));

    h.tick().await.unwrap();

    assert_eq!(h.device().await.serial, "1234");
    assert!(h.fakes.device_service.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn registration_is_attempted_once_per_backoff_window() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "other-model", "device-key-1"))));

    h.tick().await.unwrap();
    h.tick().await.unwrap();
    assert_eq!(h.changes_of_kind("become-operational").await.len(), 1);

    h.fakes.clock.advance(Duration::from_secs(5 * 60));
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "pc", "device-key-1"))));
    h.tick().await.unwrap();

    assert_eq!(h.changes_of_kind("become-operational").await.len(), 2);
    assert_eq!(h.device().await.serial, "9999");
}

#[tokio::test]
async fn unregister_forgets_identity_and_can_pause_registration() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "pc", "device-key-1"))));
    h.tick().await.unwrap();
    assert!(h.device().await.is_registered());

    h.manager
        .unregister(UnregisterOptions {
            no_registration_until_reboot: true,
        })
        .await
        .unwrap();

    let device = h.device().await;
    assert!(!device.is_registered());
    assert!(!device.has_key());
    assert!(h.fakes.keypair.keys.lock().unwrap().is_empty());

    h.tick().await.unwrap();
    assert_eq!(h.changes_of_kind("become-operational").await.len(), 1);
}

#[tokio::test]
async fn refused_serial_request_is_retried_later() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes.device_service.reply(Err(DeviceServiceError::Rejected(
        "unexpected status 400 Bad Request: try again".into(),
    )));

    h.tick().await.unwrap();

    let chg = h.changes_of_kind("become-operational").await[0].id.clone();
    let request = h.task_of_kind(&chg, "request-serial").await;
    assert_eq!(request.status, Status::Do);
    assert!(request.at_time_ms.is_some());
    assert_eq!(request.get::<u32>("pre-poll-tentatives").unwrap(), Some(1));
    assert!(request
        .log
        .iter()
        .any(|l| l.contains("Cannot deliver device serial request, will retry in 60 seconds")));

    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "pc", "device-key-1"))));
    h.fakes.clock.advance(Duration::from_secs(60));
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "request-serial").await, Status::Done);
    assert_eq!(h.device().await.serial, "9999");
}

#[tokio::test]
async fn serial_polling_resumes_with_the_stored_request_after_a_crash() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    h.fakes.device_service.reply(Ok(SerialResponse::Poll));
    h.tick().await.unwrap();

    let chg = h.changes_of_kind("become-operational").await[0].id.clone();
    let request = h.task_of_kind(&chg, "request-serial").await;
    let stored: SerialSetup = request.get("serial-setup").unwrap().unwrap();
    assert!(!stored.serial_request.is_empty());
    {
        let state = h.manager.state();
        state.lock().await.task_mut(&request.id).unwrap().status = Status::Doing;
        state.checkpoint().await.unwrap();
    }

    let h = h.restart_daemon(mode(SystemMode::Run)).await;
    h.fakes
        .device_service
        .reply(Ok(SerialResponse::Issued(serial("9999", "pc", "device-key-1"))));
    h.fakes.clock.advance(Duration::from_secs(60));
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "request-serial").await, Status::Done);
    assert_eq!(h.device().await.serial, "9999");
    let requests = h.fakes.device_service.requests.lock().unwrap().clone();
    assert_eq!(requests, vec![stored.serial_request.clone(); 2]);
    assert_eq!(h.fakes.device_service.request_ids.load(Ordering::SeqCst), 1);
}
