mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{model, mode, Harness};
use dl_app::{DeviceManagerError, RemodelOptions};
use dl_core::model::Grade;
use dl_core::ports::TryRecoveryOutcome;
use dl_core::recovery::{DefaultRecoverySystem, SeededSystem};
use dl_core::seed::SnapKind;
use dl_core::snap::{SnapRegistry, SnapSetup};
use dl_core::state::keys;
use dl_core::{ModelAssertion, RemodelKind, Status, SystemMode};

/// Label of the recovery system created by a remodel at the test clock.
const REMODEL_LABEL: &str = "20231114";

fn revised(grade: Grade) -> ModelAssertion {
    let mut new = model(grade);
    new.revision = 2;
    new
}

fn plan_kernel(h: &Harness, revision: &str) {
    let path = h.local_snap("pc-kernel", revision);
    *h.fakes.planner.plan.lock().unwrap() = vec![SnapSetup {
        name: "pc-kernel".into(),
        revision: revision.into(),
        path,
        kind: SnapKind::Kernel,
        required: true,
    }];
}

async fn registry(h: &Harness) -> SnapRegistry {
    h.get(keys::SNAPS).await.unwrap()
}

#[tokio::test]
async fn remodel_injects_snaps_and_a_tested_recovery_system() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    plan_kernel(&h, "2");

    let chg = h
        .manager
        .remodel(revised(Grade::Dangerous), RemodelOptions::default())
        .await
        .unwrap();
    h.runner.run_pass().await.unwrap();

    let tasks = h.change_tasks(&chg).await;
    let kinds: Vec<&str> = tasks.iter().map(|t| t.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "prepare-remodeling",
            "set-model",
            "link-snap",
            "create-recovery-system",
            "finalize-recovery-system",
        ]
    );
    let set_model = h.task_of_kind(&chg, "set-model").await;
    for injected in &tasks[2..] {
        assert!(set_model.wait_for.contains(&injected.id), "{}", injected.kind);
    }
    assert_eq!(set_model.status, Status::Do);
    assert_eq!(h.status_of(&chg, "link-snap").await, Status::Done);
    assert_eq!(h.status_of(&chg, "create-recovery-system").await, Status::Done);
    assert!(h.snap_file("pc-kernel", "2").exists());
    assert!(h.fakes.boot.called(&format!("try:{REMODEL_LABEL}")));
    assert_eq!(h.fakes.planner.kinds.lock().unwrap()[0], RemodelKind::Update);

    let err = h
        .manager
        .remodel(revised(Grade::Dangerous), RemodelOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot remodel while remodel is in progress");

    h.fakes.restart.complete();
    *h.fakes.boot.try_outcome.lock().unwrap() = Some(TryRecoveryOutcome {
        label: REMODEL_LABEL.into(),
        success: true,
    });
    let h = h.restart_daemon(mode(SystemMode::Run)).await;
    h.manager.ensure().await.unwrap();
    h.fakes.clock.advance(Duration::from_secs(5));
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "finalize-recovery-system").await, Status::Done);
    assert_eq!(h.status_of(&chg, "set-model").await, Status::Done);
    assert_eq!(h.manager.current_model().await.unwrap().unwrap().revision, 2);
    assert_eq!(registry(&h).await["pc-kernel"].revision, "2");

    assert!(h.fakes.boot.called(&format!("promote:{REMODEL_LABEL}")));
    let seeded: Vec<SeededSystem> = h.get(keys::SEEDED_SYSTEMS).await.unwrap();
    assert_eq!(seeded[0].system, REMODEL_LABEL);
    assert_eq!(seeded[0].revision, 2);
    let default: DefaultRecoverySystem = h.get(keys::DEFAULT_RECOVERY_SYSTEM).await.unwrap();
    assert_eq!(default.system, REMODEL_LABEL);
    assert_eq!(h.get::<Vec<String>>(keys::TRIED_SYSTEMS).await, None);
}

#[tokio::test]
async fn failed_promotion_after_the_model_commit_keeps_the_remodel() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;
    plan_kernel(&h, "2");
    let chg = h
        .manager
        .remodel(revised(Grade::Dangerous), RemodelOptions::default())
        .await
        .unwrap();
    h.runner.run_pass().await.unwrap();

    h.fakes.restart.complete();
    *h.fakes.boot.try_outcome.lock().unwrap() = Some(TryRecoveryOutcome {
        label: REMODEL_LABEL.into(),
        success: true,
    });
    h.fakes.boot.fail_promote.store(true, Ordering::SeqCst);
    let h = h.restart_daemon(mode(SystemMode::Run)).await;
    h.manager.ensure().await.unwrap();
    h.fakes.clock.advance(Duration::from_secs(5));
    h.runner.run_pass().await.unwrap();

    let set_model = h.task_of_kind(&chg, "set-model").await;
    assert_eq!(set_model.status, Status::Done);
    assert!(set_model
        .log
        .iter()
        .any(|l| l.contains("Cannot promote recovery system")));
    assert_eq!(h.status_of(&chg, "link-snap").await, Status::Done);
    assert_eq!(h.change_err(&chg).await, None);
    assert_eq!(h.manager.current_model().await.unwrap().unwrap().revision, 2);
    assert_eq!(h.device().await.model, "pc");
    assert_eq!(registry(&h).await["pc-kernel"].revision, "2");
}

#[tokio::test]
async fn grade_and_revision_downgrades_are_refused() {
    let h = Harness::seeded_run(&model(Grade::Dangerous)).await;

    let err = h
        .manager
        .remodel(revised(Grade::Signed), RemodelOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeviceManagerError::GradeChange {
            from: Grade::Dangerous,
            to: Grade::Signed
        }
    ));
    assert_eq!(
        err.to_string(),
        "cannot remodel from grade dangerous to grade signed"
    );

    let mut older = model(Grade::Dangerous);
    older.revision = 0;
    let err = h
        .manager
        .remodel(older, RemodelOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot remodel to older revision 0 of model canonical/pc"
    );
    assert!(h.changes_of_kind("remodel").await.is_empty());
}

#[tokio::test]
async fn reregistration_drops_the_serial() {
    let h = Harness::seeded_run(&model(Grade::Unset)).await;
    {
        let mut st = h.manager.state().lock().await;
        let device = dl_core::DeviceState {
            brand: "canonical".into(),
            model: "pc".into(),
            serial: "9999".into(),
            key_id: "device-key-1".into(),
            session_macaroon: "old-session".into(),
        };
        st.set(keys::DEVICE, &device).unwrap();
    }
    let mut new = model(Grade::Unset);
    new.model = "pc-new".into();

    let chg = h
        .manager
        .remodel(new, RemodelOptions::default())
        .await
        .unwrap();
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "set-model").await, Status::Done);
    assert_eq!(h.change_tasks(&chg).await.len(), 2);
    let device = h.device().await;
    assert_eq!(device.model, "pc-new");
    assert_eq!(device.serial, "");
    assert_eq!(device.session_macaroon, "");
    assert_eq!(device.key_id, "device-key-1");
    assert_eq!(
        *h.fakes.device_service.sessions.lock().unwrap(),
        vec!["canonical/pc-new".to_string()]
    );
}

#[tokio::test]
async fn store_switch_adopts_the_new_session() {
    let h = Harness::seeded_run(&model(Grade::Unset)).await;
    let mut new = revised(Grade::Unset);
    new.store = Some("brand-store".into());

    h.manager
        .remodel(new, RemodelOptions::default())
        .await
        .unwrap();
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.device().await.session_macaroon, "session-for-pc");
    assert_eq!(
        h.fakes.planner.kinds.lock().unwrap()[0],
        RemodelKind::StoreSwitch
    );
}

#[tokio::test]
async fn rejected_model_reverts_snaps_and_required_flags() {
    let h = Harness::seeded_run(&model(Grade::Unset)).await;
    plan_kernel(&h, "2");
    h.fakes.assertions.reject_models.store(true, Ordering::SeqCst);
    let mut new = revised(Grade::Unset);
    new.required_snaps = vec!["hello".into()];

    let chg = h
        .manager
        .remodel(new, RemodelOptions::default())
        .await
        .unwrap();
    h.runner.run_pass().await.unwrap();

    assert_eq!(h.status_of(&chg, "set-model").await, Status::Error);
    assert_eq!(h.status_of(&chg, "link-snap").await, Status::Undone);
    assert!(h
        .change_err(&chg)
        .await
        .unwrap()
        .contains("cannot add new model assertion: model signature does not verify"));

    let snaps = registry(&h).await;
    assert_eq!(snaps["pc-kernel"].revision, "1");
    assert!(!snaps["hello"].required);
    assert!(snaps["snapd"].required);
    assert_eq!(h.manager.current_model().await.unwrap().unwrap().revision, 1);
}

#[tokio::test]
async fn remodel_is_refused_before_seeding() {
    let h = Harness::new(mode(SystemMode::Run), &model(Grade::Dangerous));

    let err = h
        .manager
        .remodel(revised(Grade::Dangerous), RemodelOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "cannot remodel until fully seeded");
}
