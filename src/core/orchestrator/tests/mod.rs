
use std::sync::Arc;
use std::time::Duration;

use super::{JobKind, JobRequest, JobStatus, Orchestrator, OrchestratorSettings};
use crate::core::events::EventBus;
use crate::core::images::{ImageArtifact, StaticCatalog};
use crate::core::store::{JobRecord, Store, test_store};
use crate::core::transport::TransportSettings;
use crate::core::transport::fake::{FakeConnector, FakeDevice};

pub(super) const TARGET: &str = "cat9k_iosxe.17.09.04.SPA.bin";
pub(super) const ROUTER_IMAGE: &str = "isr4300-universalk9.17.09.04.SPA.bin";
/// Digest the fake devices compute for copied files by default.
pub(super) const TARGET_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
pub(super) const FAR_FUTURE: &str = "2099-01-01T00:00";

pub(super) struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Store,
    pub connector: Arc<FakeConnector>,
}

fn artifact(filename: &str, compatibility: &str) -> ImageArtifact {
    ImageArtifact {
        filename: filename.to_string(),
        md5: TARGET_MD5.to_string(),
        size_bytes: 1_234_567_890,
        compatibility: Some(compatibility.to_string()),
    }
}

pub(super) fn harness() -> Harness {
    harness_with(OrchestratorSettings {
        image_base_url: Some("http://images.example.net/ios".to_string()),
        ..OrchestratorSettings::default()
    })
}

pub(super) fn harness_with(settings: OrchestratorSettings) -> Harness {
    let store = test_store();
    let bus = EventBus::new(store.clone(), 256);
    let connector = Arc::new(FakeConnector::new());
    let catalog = Arc::new(StaticCatalog(vec![
        artifact(TARGET, "cat9k"),
        artifact(ROUTER_IMAGE, "isr4300"),
    ]));
    let orchestrator = Orchestrator::new(
        store.clone(),
        bus,
        connector.clone(),
        catalog,
        TransportSettings::default(),
        settings,
    );
    Harness {
        orchestrator,
        store,
        connector,
    }
}

pub(super) async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> JobRecord {
    for _ in 0..500 {
        let job = orchestrator.job(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", job_id);
}

pub(super) async fn wait_status(orchestrator: &Orchestrator, job_id: &str, status: JobStatus) {
    for _ in 0..500 {
        if orchestrator.job(job_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {:?}", job_id, status);
}

pub(super) async fn run(h: &Harness, request: JobRequest) -> JobRecord {
    let job = h.orchestrator.create_job(request).await.unwrap();
    wait_terminal(&h.orchestrator, &job.job_id).await
}

/// Register and discover a device.
pub(super) async fn discovered(h: &Harness, device: FakeDevice) -> Arc<FakeDevice> {
    let address = device.address.clone();
    let device = h.connector.add(device);
    let job = run(h, JobRequest::now(&address, JobKind::Discovery)).await;
    assert_eq!(job.status, JobStatus::Success, "discovery: {:?}", job.error);
    device
}

/// Register, discover, target `image` and run prechecks.
pub(super) async fn prechecked(h: &Harness, device: FakeDevice, image: &str) -> Arc<FakeDevice> {
    let device = discovered(h, device).await;
    h.orchestrator
        .set_target_image(&device.address, Some(image))
        .await
        .unwrap();
    let job = run(h, JobRequest::now(&device.address, JobKind::Precheck)).await;
    assert_eq!(job.status, JobStatus::Success, "precheck: {:?}", job.error);
    device
}

/// Healthy single-member switch that already holds `TARGET`.
pub(super) fn ready_switch(address: &str) -> FakeDevice {
    let device = FakeDevice::switch(address, "C9300-48P", "17.06.05", &[4000]);
    device.add_file(TARGET, TARGET_MD5);
    device
}
