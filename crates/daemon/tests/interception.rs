use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use usbgate_backend_mock::{
    FakeDevice, MockAuthorizer, MockMountBackend, MockNotifier, MountBehavior, ScriptedEventSource,
};
use usbgate_common::backend::AuthorizationOutcome;
use usbgate_common::config::NotificationConfig;
use usbgate_common::error::RegistrationError;
use usbgate_common::types::{
    DeviceIdentifier, DeviceOutcome, InterceptionDecision, MountCommand, MountTarget,
};
use usbgate_daemon::{DeviceEventLoop, InterceptionEngine, NotificationDispatcher};

struct Harness {
    mount: MockMountBackend,
    notifier: MockNotifier,
    event_loop: DeviceEventLoop,
}

impl Harness {
    fn new(mount: MockMountBackend, notifier: MockNotifier) -> Self {
        Self::with_engine(mount, notifier, |e| e)
    }

    fn with_engine(
        mount: MockMountBackend,
        notifier: MockNotifier,
        configure: impl FnOnce(InterceptionEngine) -> InterceptionEngine,
    ) -> Self {
        let dispatcher =
            NotificationDispatcher::new(Arc::new(notifier.clone()), &NotificationConfig::default());
        let engine = configure(InterceptionEngine::new(Arc::new(mount.clone()), dispatcher));
        Self {
            mount,
            notifier,
            event_loop: DeviceEventLoop::new(engine),
        }
    }

    async fn run_initial(&mut self, devices: Vec<FakeDevice>) {
        let (source, tx) =
            ScriptedEventSource::new(devices.into_iter().map(FakeDevice::into_handle).collect());
        drop(tx);
        self.event_loop.run(source).await.expect("subscribe");
        self.event_loop.engine().dispatcher().drain().await;
    }

    fn decisions(&self) -> Vec<InterceptionDecision> {
        self.event_loop
            .engine()
            .ledger()
            .snapshot()
            .into_iter()
            .map(|r| r.decision)
            .collect()
    }
}

fn sandisk() -> FakeDevice {
    FakeDevice::new("sdb1")
        .with_parent_product_name("SanDisk Ultra")
        .with_ids(0x0781, 0x5581)
        .with_target("/dev/sdb1")
}

#[tokio::test]
async fn sandisk_is_notified_unmounted_and_left_blocked() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    h.run_initial(vec![sandisk()]).await;

    let notes = h.notifier.requests();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].body, "SanDisk Ultra");
    assert_eq!(notes[0].title, "USB Device Detected");
    assert_eq!(
        h.mount.calls(),
        vec![(MountCommand::Unmount, MountTarget::new("/dev/sdb1"))]
    );
    let records = h.event_loop.engine().ledger().snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].identifier,
        DeviceIdentifier::ProductName("SanDisk Ultra".into())
    );
    assert_eq!(records[0].decision, InterceptionDecision::DeniedNotRemounted);
}

#[tokio::test]
async fn vendor_product_fallback_identifier() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    h.run_initial(vec![FakeDevice::new("sdc1")
        .with_ids(1452, 591)
        .with_target("/dev/sdc1")])
        .await;

    let records = h.event_loop.engine().ledger().snapshot();
    assert_eq!(records[0].identifier.to_string(), "VendorID: 05ac, ProductID: 024f");
    assert_eq!(h.mount.count(MountCommand::Unmount), 1);
    assert_eq!(h.notifier.requests()[0].body, "VendorID: 05ac, ProductID: 024f");
}

#[tokio::test]
async fn two_devices_in_one_batch_keep_arrival_order() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    let (source, tx) = ScriptedEventSource::new(Vec::new());
    tx.send(vec![
        FakeDevice::new("sdb1")
            .with_product_name("Stick A")
            .with_target("/dev/sdb1")
            .into_handle(),
        FakeDevice::new("sdc1")
            .with_ids(0x1234, 0xabcd)
            .with_target("/dev/sdc1")
            .into_handle(),
    ])
    .await
    .unwrap();
    drop(tx);
    h.event_loop.run(source).await.unwrap();

    let records = h.event_loop.engine().ledger().snapshot();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].instance, 1);
    assert_eq!(records[0].identifier, DeviceIdentifier::ProductName("Stick A".into()));
    assert_eq!(records[0].target, Some(MountTarget::new("/dev/sdb1")));
    assert_eq!(records[1].instance, 2);
    assert_eq!(
        records[1].identifier,
        DeviceIdentifier::VendorProductFallback {
            vendor_id: 0x1234,
            product_id: 0xabcd
        }
    );
    assert_eq!(records[1].target, Some(MountTarget::new("/dev/sdc1")));
    let targets: Vec<_> = h.mount.calls().into_iter().map(|(_, t)| t).collect();
    assert_eq!(
        targets,
        vec![MountTarget::new("/dev/sdb1"), MountTarget::new("/dev/sdc1")]
    );
}

#[tokio::test]
async fn startup_devices_are_processed_before_live_ones() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    let (source, tx) = ScriptedEventSource::new(vec![FakeDevice::new("sdb1")
        .with_product_name("Present")
        .with_target("/dev/sdb1")
        .into_handle()]);
    tx.send(vec![FakeDevice::new("sdc1")
        .with_product_name("Later")
        .with_target("/dev/sdc1")
        .into_handle()])
        .await
        .unwrap();
    drop(tx);
    h.event_loop.run(source).await.unwrap();

    let names: Vec<String> = h
        .event_loop
        .engine()
        .ledger()
        .snapshot()
        .into_iter()
        .map(|r| r.identifier.to_string())
        .collect();
    assert_eq!(names, vec!["Present", "Later"]);
}

#[tokio::test]
async fn unidentifiable_device_is_skipped_and_released() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    let device = FakeDevice::new("sdd1").with_target("/dev/sdd1");
    let releases = device.releases();
    let outcome = h.event_loop.process(device.into_handle()).await;
    h.event_loop.engine().dispatcher().drain().await;

    assert_eq!(outcome, DeviceOutcome::Skipped);
    assert!(h.mount.calls().is_empty());
    assert!(h.notifier.requests().is_empty());
    assert!(h.event_loop.engine().ledger().is_empty());
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handle_is_released_after_processing() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    let device = sandisk();
    let releases = device.releases();
    h.run_initial(vec![device]).await;
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn granted_authorization_remounts() {
    let authorizer = MockAuthorizer::new(AuthorizationOutcome::Granted);
    let auth = authorizer.clone();
    let mut h = Harness::with_engine(MockMountBackend::default(), MockNotifier::default(), |e| {
        e.with_authorizer(Arc::new(auth))
    });
    h.run_initial(vec![sandisk()]).await;

    let target = MountTarget::new("/dev/sdb1");
    assert_eq!(
        h.mount.calls(),
        vec![
            (MountCommand::Unmount, target.clone()),
            (MountCommand::Mount, target)
        ]
    );
    assert_eq!(authorizer.requests().len(), 1);
    assert_eq!(h.decisions(), vec![InterceptionDecision::Authorized]);
}

#[tokio::test]
async fn denied_authorization_stays_blocked() {
    let mut h = Harness::with_engine(MockMountBackend::default(), MockNotifier::default(), |e| {
        e.with_authorizer(Arc::new(MockAuthorizer::new(AuthorizationOutcome::Denied)))
    });
    h.run_initial(vec![sandisk()]).await;

    assert_eq!(h.mount.count(MountCommand::Unmount), 1);
    assert_eq!(h.mount.count(MountCommand::Mount), 0);
    assert_eq!(h.decisions(), vec![InterceptionDecision::DeniedNotRemounted]);
}

#[tokio::test]
async fn hung_authorization_does_not_block_the_next_device() {
    let mut h = Harness::with_engine(MockMountBackend::default(), MockNotifier::default(), |e| {
        e.with_authorizer(Arc::new(MockAuthorizer::hanging()))
            .with_authorization_timeout(Duration::from_millis(50))
    });
    h.run_initial(vec![
        sandisk(),
        FakeDevice::new("sdc1")
            .with_product_name("Second")
            .with_target("/dev/sdc1"),
    ])
    .await;

    assert_eq!(h.mount.count(MountCommand::Unmount), 2);
    assert_eq!(h.mount.count(MountCommand::Mount), 0);
    assert_eq!(
        h.decisions(),
        vec![
            InterceptionDecision::DeniedNotRemounted,
            InterceptionDecision::DeniedNotRemounted
        ]
    );
}

#[tokio::test]
async fn failed_unmount_is_an_error_outcome() {
    let authorizer = MockAuthorizer::new(AuthorizationOutcome::Granted);
    let auth = authorizer.clone();
    let mut h = Harness::with_engine(
        MockMountBackend::default().with_unmount(MountBehavior::Fail),
        MockNotifier::default(),
        |e| e.with_authorizer(Arc::new(auth)),
    );
    h.run_initial(vec![sandisk()]).await;

    match &h.decisions()[..] {
        [InterceptionDecision::Error { command, reason }] => {
            assert_eq!(*command, MountCommand::Unmount);
            assert!(reason.contains("mock failure"));
        }
        other => panic!("unexpected decisions: {other:?}"),
    }
    assert!(authorizer.requests().is_empty());
    assert_eq!(h.mount.count(MountCommand::Mount), 0);
}

#[tokio::test]
async fn not_yet_mounted_device_still_reaches_authorization() {
    let authorizer = MockAuthorizer::new(AuthorizationOutcome::Granted);
    let auth = authorizer.clone();
    let mut h = Harness::with_engine(
        MockMountBackend::default().with_unmount(MountBehavior::NotMounted),
        MockNotifier::default(),
        |e| e.with_authorizer(Arc::new(auth)),
    );
    h.run_initial(vec![sandisk()]).await;

    let target = MountTarget::new("/dev/sdb1");
    assert_eq!(
        h.mount.calls(),
        vec![
            (MountCommand::Unmount, target.clone()),
            (MountCommand::Mount, target)
        ]
    );
    assert_eq!(authorizer.requests().len(), 1);
    assert_eq!(h.decisions(), vec![InterceptionDecision::Authorized]);
}

#[tokio::test]
async fn not_yet_mounted_device_without_authorizer_stays_blocked() {
    let mut h = Harness::new(
        MockMountBackend::default().with_unmount(MountBehavior::NotMounted),
        MockNotifier::default(),
    );
    h.run_initial(vec![sandisk()]).await;

    assert_eq!(h.mount.count(MountCommand::Unmount), 1);
    assert_eq!(h.decisions(), vec![InterceptionDecision::DeniedNotRemounted]);
}

#[tokio::test]
async fn hung_unmount_times_out() {
    let mut h = Harness::with_engine(
        MockMountBackend::default().with_unmount(MountBehavior::Hang),
        MockNotifier::default(),
        |e| e.with_command_timeout(Duration::from_millis(50)),
    );
    h.run_initial(vec![
        sandisk(),
        FakeDevice::new("sdc1")
            .with_product_name("Second")
            .with_target("/dev/sdc1"),
    ])
    .await;

    let timed_out = InterceptionDecision::TimedOut {
        command: MountCommand::Unmount,
    };
    assert_eq!(h.decisions(), vec![timed_out.clone(), timed_out]);
}

#[tokio::test]
async fn failed_remount_is_an_error_outcome() {
    let mut h = Harness::with_engine(
        MockMountBackend::default().with_mount(MountBehavior::Fail),
        MockNotifier::default(),
        |e| e.with_authorizer(Arc::new(MockAuthorizer::new(AuthorizationOutcome::Granted))),
    );
    h.run_initial(vec![sandisk()]).await;

    assert!(matches!(
        &h.decisions()[..],
        [InterceptionDecision::Error {
            command: MountCommand::Mount,
            ..
        }]
    ));
}

#[tokio::test]
async fn notification_failure_does_not_change_the_decision() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::failing());
    h.run_initial(vec![sandisk()]).await;

    assert_eq!(h.notifier.requests().len(), 1);
    assert_eq!(h.mount.count(MountCommand::Unmount), 1);
    assert_eq!(h.decisions(), vec![InterceptionDecision::DeniedNotRemounted]);
}

#[tokio::test]
async fn device_without_mount_target_is_not_unmounted() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    h.run_initial(vec![FakeDevice::new("usb2/2-1").with_product_name("Hub")])
        .await;

    assert!(h.mount.calls().is_empty());
    assert_eq!(h.notifier.requests().len(), 1);
    assert!(matches!(
        &h.decisions()[..],
        [InterceptionDecision::Error {
            command: MountCommand::Unmount,
            ..
        }]
    ));
}

#[tokio::test]
async fn registration_failure_aborts_the_loop() {
    let mut h = Harness::new(MockMountBackend::default(), MockNotifier::default());
    let err = h
        .event_loop
        .run(ScriptedEventSource::failing())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Monitor(_)));
    assert!(h.event_loop.engine().ledger().is_empty());
}
