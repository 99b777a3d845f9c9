/// 测试辅助：记录任务的 JobRunner 与常用夹具

use async_trait::async_trait;
use chrono::Utc;
use common::models::{Brand, Disk, Instance, InstanceState, Job, JobRequest, JobSignal, PciSlot};
use common::ws_rpc::NodeCapacityReport;
use common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::Config;
use crate::services::capacity_service::NodeRegistry;
use crate::services::job_service::JobRunner;
use crate::store::{InstanceStore, MemoryStore};
use crate::ws::AgentConnectionManager;

/// 只记录、不执行的 JobRunner
pub struct RecordingJobRunner {
    store: Arc<dyn InstanceStore>,
    submitted: Mutex<Vec<JobRequest>>,
    signals: Mutex<Vec<(Uuid, JobSignal)>>,
    fail_submit: AtomicBool,
}

impl RecordingJobRunner {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            submitted: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            fail_submit: AtomicBool::new(false),
        }
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn last_submitted(&self) -> JobRequest {
        self.submitted().pop().expect("no job submitted")
    }

    pub fn signals(&self) -> Vec<(Uuid, JobSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRunner for RecordingJobRunner {
    async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("Server {} is not connected", request.node_id)));
        }
        let job = Job::from_request(request.clone());
        self.store.put_job(&job).await?;
        self.submitted.lock().unwrap().push(request);
        Ok(job.uuid)
    }

    async fn poll(&self, job_uuid: Uuid) -> Result<Job> {
        self.store
            .get_job(job_uuid)
            .await?
            .ok_or_else(|| Error::not_found(format!("Job {} not found", job_uuid)))
    }

    async fn signal(&self, job_uuid: Uuid, signal: JobSignal) -> Result<()> {
        self.signals.lock().unwrap().push((job_uuid, signal));
        Ok(())
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub jobs: Arc<RecordingJobRunner>,
}

pub fn test_env_with(config: Config) -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let jobs = Arc::new(RecordingJobRunner::new(store.clone()));
    let state = AppState::new(
        config,
        store.clone(),
        jobs.clone(),
        NodeRegistry::new(),
        AgentConnectionManager::new(),
    );
    TestEnv { state, store, jobs }
}

pub fn test_env() -> TestEnv {
    test_env_with(Config::default())
}

impl TestEnv {
    pub async fn add_node(&self, node_id: &str, available_ram: i64, available_disk: i64) {
        self.state
            .nodes()
            .report(NodeCapacityReport {
                node_id: node_id.to_string(),
                available_ram,
                available_disk,
                available_cpu: 800,
            })
            .await;
    }

    pub async fn add_instance(&self, instance: &Instance) {
        self.store.put_instance(instance).await.unwrap();
    }
}

/// 运行在 cn-1 上的 flexible bhyve 实例：2048 MiB 内存，20480 MiB 预算，10240 MiB 启动盘
pub fn bhyve_instance() -> Instance {
    Instance {
        uuid: Uuid::new_v4(),
        alias: Some("web-1".into()),
        owner_uuid: Uuid::new_v4(),
        brand: Brand::Bhyve,
        state: InstanceState::Running,
        node_id: Some("cn-1".into()),
        billing_id: Uuid::new_v4(),
        ram: 2048,
        cpu_cap: Some(100),
        quota: 0,
        flexible_disk_size: Some(20480),
        disks: vec![Disk {
            uuid: Uuid::new_v4(),
            pci_slot: PciSlot::BASE,
            size: 10240,
            image_uuid: Some(Uuid::new_v4()),
            boot: true,
        }],
        tags: BTreeMap::new(),
        do_not_inventory: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
