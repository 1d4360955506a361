//! Orchestrator integration tests against a local git repository,
//! a recording service manager and a recording reverse proxy

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use dockyard::deploy::fsm::INTERRUPTED_MESSAGE;
use dockyard::deploy::supervisor::ServiceManager;
use dockyard::deploy::{EngineConfig, Orchestrator};
use dockyard::errors::EngineError;
use dockyard::models::{
    DeploymentStatus, EnvVar, NewProject, Project, ProjectStatus, ProjectUpdate,
};
use dockyard::proxy::{HostRequest, ReverseProxy};
use dockyard::storage::db::{Database, DbHandle};
use dockyard::storage::layout::StorageLayout;

// ================================== FAKES ======================================== //

struct FakeServices {
    calls: Mutex<Vec<String>>,
    active: AtomicBool,
}

impl FakeServices {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        }
    }

    fn record(&self, call: String) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn write_unit(&self, unit: &str, _contents: &str) -> Result<(), EngineError> {
        self.record(format!("write {}", unit))
    }
    async fn remove_unit(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("remove {}", unit))
    }
    async fn reload(&self) -> Result<(), EngineError> {
        self.record("reload".to_string())
    }
    async fn enable(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("enable {}", unit))
    }
    async fn disable(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("disable {}", unit))
    }
    async fn start(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("start {}", unit))
    }
    async fn stop(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("stop {}", unit))
    }
    async fn restart(&self, unit: &str) -> Result<(), EngineError> {
        self.record(format!("restart {}", unit))
    }
    async fn is_active(&self, _unit: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeProxy {
    calls: Mutex<Vec<String>>,
}

impl FakeProxy {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReverseProxy for FakeProxy {
    async fn create_host(&self, host: &HostRequest) -> Result<i64, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create {} -> {}", host.domain, host.upstream));
        Ok(42)
    }

    async fn delete_host(&self, host_id: i64) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("delete {}", host_id));
        Ok(())
    }

    async fn reload(&self) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push("reload".to_string());
        Ok(())
    }
}

// ================================= HARNESS ======================================= //

async fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=dockyard", "-c", "user.email=dockyard@localhost"])
        .args(args)
        .status()
        .await
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

struct Harness {
    tmp: TempDir,
    layout: StorageLayout,
    db: DbHandle,
    services: Arc<FakeServices>,
    proxy: Arc<FakeProxy>,
    orchestrator: Arc<Orchestrator>,
    repo_url: String,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let tmp = tempfile::tempdir().unwrap();

        let repo = tmp.path().join("upstream");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        git(&repo, &["init", "-q", "-b", "main"]).await;
        tokio::fs::write(repo.join("server"), "#!/bin/sh\nexec sleep 60\n")
            .await
            .unwrap();
        git(&repo, &["add", "."]).await;
        git(&repo, &["commit", "-q", "-m", "first"]).await;
        let repo_url = format!("file://{}", repo.display());

        let layout = StorageLayout::new(tmp.path().join("data"));
        layout.setup().await.unwrap();

        let db = DbHandle::new(Database::open_in_memory().unwrap());
        let services = Arc::new(FakeServices::new());
        let proxy = Arc::new(FakeProxy::default());
        let config = EngineConfig {
            start_grace: Duration::from_millis(50),
            ..config
        };
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            layout.clone(),
            services.clone(),
            proxy.clone(),
            config,
            CancellationToken::new(),
        ));

        Self {
            tmp,
            layout,
            db,
            services,
            proxy,
            orchestrator,
            repo_url,
        }
    }

    fn new_project(&self, name: &str) -> NewProject {
        NewProject {
            name: name.to_string(),
            repo_url: self.repo_url.clone(),
            branch: "main".to_string(),
            ..Default::default()
        }
    }

    async fn create(&self, req: NewProject) -> Project {
        self.orchestrator.create_project(req).await.unwrap()
    }

    /// Wait for the build in flight (if any) to release the project
    async fn settle(&self, id: i64) {
        for _ in 0..1500 {
            if !self.orchestrator.is_building(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("build of project {} did not finish", id);
    }

    async fn build_and_settle(&self, id: i64) -> i64 {
        let deployment = self.orchestrator.build(id).await.unwrap();
        self.settle(id).await;
        deployment.build_num
    }

    async fn stored(&self, id: i64) -> Project {
        self.db.call(move |db| db.require_project(id)).await.unwrap()
    }
}

fn unit(id: i64) -> String {
    format!("dockyard-{}.service", id)
}

// ================================== BUILDS ======================================= //

#[tokio::test]
async fn test_build_runs_pipeline_and_starts_service() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.install_command = "test \"$GREETING\" = hello && test \"$NODE_ENV\" = production".to_string();
    req.build_command = "echo compiled > out.txt".to_string();
    req.start_command = "./server".to_string();
    req.env_vars = vec![EnvVar::new("GREETING", "hello")];
    let project = h.create(req).await;
    assert_eq!(project.status, ProjectStatus::Pending);
    assert_eq!(project.port, 10000 + project.id as u16);

    let deployment = h.orchestrator.build(project.id).await.unwrap();
    assert_eq!(deployment.build_num, 1);
    assert_eq!(deployment.status, DeploymentStatus::Building);
    h.settle(project.id).await;

    let project = h.orchestrator.get_project(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    assert_eq!(project.current_build, 1);
    assert!(project.error_message.is_none());

    let deployments = h.orchestrator.list_deployments(project.id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Success);
    assert!(!deployments[0].commit_hash.is_empty());
    assert!(deployments[0].finished_at.is_some());

    let sources = h.layout.project_source_dir(project.id);
    assert_eq!(
        sources.file("out.txt").read_string().await.unwrap(),
        "compiled\n"
    );
    assert_eq!(
        sources.file(".env").read_string().await.unwrap(),
        "GREETING=\"hello\"\n"
    );

    assert_eq!(
        h.services.calls(),
        vec![
            format!("write {}", unit(project.id)),
            "reload".to_string(),
            format!("enable {}", unit(project.id)),
            format!("restart {}", unit(project.id)),
        ]
    );

    let log = h.orchestrator.build_log(project.id, 1).await.unwrap();
    assert!(log.contains("==> Build #1 of api (main)"));
    assert!(log.contains("==> Build succeeded"));
    assert!(log.contains("==> Service is running"));
}

#[tokio::test]
async fn test_at_most_one_build_in_flight() {
    let h = Harness::new().await;
    let mut req = h.new_project("slow");
    req.install_command = "sleep 1".to_string();
    let project = h.create(req).await;

    h.orchestrator.build(project.id).await.unwrap();
    let second = h.orchestrator.build(project.id).await;
    assert!(matches!(second, Err(EngineError::AlreadyBuilding(id)) if id == project.id));

    // Other exclusive operations are refused too
    assert!(matches!(
        h.orchestrator
            .update_project(project.id, ProjectUpdate::default())
            .await,
        Err(EngineError::AlreadyBuilding(_))
    ));
    assert!(matches!(
        h.orchestrator.delete_project(project.id).await,
        Err(EngineError::AlreadyBuilding(_))
    ));

    let deployments = h.orchestrator.list_deployments(project.id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Building);

    h.settle(project.id).await;
    let deployments = h.orchestrator.list_deployments(project.id).await.unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0].status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_build_numbers_are_sequential() {
    let h = Harness::new().await;
    let project = h.create(h.new_project("site")).await;

    for expected in 1..=4 {
        assert_eq!(h.build_and_settle(project.id).await, expected);
    }

    let numbers: Vec<i64> = h
        .orchestrator
        .list_deployments(project.id)
        .await
        .unwrap()
        .iter()
        .map(|d| d.build_num)
        .collect();
    assert_eq!(numbers, vec![4, 3, 2, 1]);
    assert_eq!(h.stored(project.id).await.current_build, 4);
}

#[tokio::test]
async fn test_failed_install_isolates_the_build() {
    let h = Harness::new().await;
    let mut req = h.new_project("broken");
    req.install_command = "echo installing; exit 7".to_string();
    req.start_command = "./server".to_string();
    let project = h.create(req).await;

    h.build_and_settle(project.id).await;

    let project = h.orchestrator.get_project(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Error);
    let message = project.error_message.unwrap();
    assert!(message.contains("exited with status 7"), "{}", message);

    let deployment = &h.orchestrator.list_deployments(project.id).await.unwrap()[0];
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error.is_some());

    // Nothing was installed or started
    assert!(h.services.calls().is_empty());

    let log = h.orchestrator.build_log(project.id, 1).await.unwrap();
    assert!(log.contains("installing"));
    assert!(log.contains("Build failed:"));

    // The next build starts from a clean slate
    h.orchestrator
        .update_project(
            project.id,
            ProjectUpdate {
                install_command: Some("true".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.build_and_settle(project.id).await, 2);
    let project = h.orchestrator.get_project(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Running);
    assert!(project.error_message.is_none());
}

#[tokio::test]
async fn test_fetch_failure_marks_build_failed() {
    let h = Harness::new().await;
    let mut req = h.new_project("missing");
    req.repo_url = format!("file://{}", h.tmp.path().join("nowhere").display());
    let project = h.create(req).await;

    h.build_and_settle(project.id).await;

    let stored = h.stored(project.id).await;
    assert_eq!(stored.status, ProjectStatus::Error);
    assert!(stored.error_message.unwrap().starts_with("Fetch error"));
    let deployment = &h.orchestrator.list_deployments(project.id).await.unwrap()[0];
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.commit_hash, "");
}

#[tokio::test]
async fn test_build_timeout_fails_the_build() {
    let h = Harness::with_config(EngineConfig {
        build_timeout: Duration::from_millis(500),
        ..Default::default()
    })
    .await;
    let mut req = h.new_project("hangs");
    req.install_command = "sleep 30".to_string();
    let project = h.create(req).await;

    let started = std::time::Instant::now();
    h.build_and_settle(project.id).await;
    assert!(started.elapsed() < Duration::from_secs(15));

    let stored = h.stored(project.id).await;
    assert_eq!(stored.status, ProjectStatus::Error);
    assert!(stored.error_message.unwrap().contains("timed out"));
    let deployment = &h.orchestrator.list_deployments(project.id).await.unwrap()[0];
    assert_eq!(deployment.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_service_death_after_successful_build() {
    let h = Harness::new().await;
    h.services.set_active(false);
    let mut req = h.new_project("crashy");
    req.start_command = "./server".to_string();
    req.domain = Some("crashy.example.com".to_string());
    let project = h.create(req).await;

    h.build_and_settle(project.id).await;

    let stored = h.stored(project.id).await;
    assert_eq!(stored.status, ProjectStatus::Error);
    assert!(stored.error_message.unwrap().contains("exited within"));
    // The build itself succeeded
    let deployment = &h.orchestrator.list_deployments(project.id).await.unwrap()[0];
    assert_eq!(deployment.status, DeploymentStatus::Success);
    // No route for a dead process
    assert!(h.proxy.calls().is_empty());
    assert_eq!(stored.host_id, 0);
}

#[tokio::test]
async fn test_live_build_log_subscription() {
    let h = Harness::new().await;
    let mut req = h.new_project("chatty");
    req.install_command = "sleep 1; echo hello-from-install".to_string();
    let project = h.create(req).await;

    assert!(matches!(
        h.orchestrator.subscribe_build_log(project.id),
        Err(EngineError::NotFound(_))
    ));

    h.orchestrator.build(project.id).await.unwrap();
    let (_sink, mut subscription) = h.orchestrator.subscribe_build_log(project.id).unwrap();

    let mut received = Vec::new();
    let collect = async {
        while let Some(chunk) = subscription.recv().await {
            received.extend_from_slice(&chunk);
        }
    };
    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .expect("stream ends when the build finishes");

    let received = String::from_utf8(received).unwrap();
    assert!(received.contains("hello-from-install"));
    assert!(received.contains("==> Build succeeded"));
}

// ============================ LIFECYCLE CONTROL ================================== //

#[tokio::test]
async fn test_rollback_to_earlier_build() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.start_command = "./server".to_string();
    let project = h.create(req).await;

    for _ in 0..5 {
        h.build_and_settle(project.id).await;
    }
    let restarts_before = h.services.count(&format!("restart {}", unit(project.id)));
    assert_eq!(restarts_before, 5);

    let rolled = h.orchestrator.rollback(project.id, 3).await.unwrap();
    assert_eq!(rolled.current_build, 3);
    assert_eq!(rolled.status, ProjectStatus::Running);
    assert_eq!(
        h.services.count(&format!("restart {}", unit(project.id))),
        restarts_before + 1
    );

    let deployments = h.orchestrator.list_deployments(project.id).await.unwrap();
    let status_of = |n: i64| {
        deployments
            .iter()
            .find(|d| d.build_num == n)
            .map(|d| d.status)
            .unwrap()
    };
    for n in 1..=3 {
        assert_eq!(status_of(n), DeploymentStatus::Success);
    }
    assert_eq!(status_of(4), DeploymentStatus::RolledBack);
    assert_eq!(status_of(5), DeploymentStatus::RolledBack);

    // Rolled-back and unknown builds are not valid targets
    assert!(matches!(
        h.orchestrator.rollback(project.id, 4).await,
        Err(EngineError::InvalidRollback(_))
    ));
    assert!(matches!(
        h.orchestrator.rollback(project.id, 99).await,
        Err(EngineError::InvalidRollback(_))
    ));

    // Numbering continues past the rolled-back builds
    assert_eq!(h.build_and_settle(project.id).await, 6);
}

#[tokio::test]
async fn test_rollback_rejects_failed_build() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.install_command = "exit 1".to_string();
    let project = h.create(req).await;
    h.build_and_settle(project.id).await;

    let result = h.orchestrator.rollback(project.id, 1).await;
    assert!(matches!(result, Err(EngineError::InvalidRollback(_))));
    assert_eq!(h.stored(project.id).await.current_build, 1);
}

#[tokio::test]
async fn test_start_and_stop() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.start_command = "./server".to_string();
    let project = h.create(req).await;

    // Never built
    assert!(matches!(
        h.orchestrator.start_project(project.id).await,
        Err(EngineError::ValidationError(_))
    ));

    h.build_and_settle(project.id).await;

    let stopped = h.orchestrator.stop_project(project.id).await.unwrap();
    assert_eq!(stopped.status, ProjectStatus::Stopped);
    assert_eq!(h.services.count(&format!("stop {}", unit(project.id))), 1);

    let started = h.orchestrator.start_project(project.id).await.unwrap();
    assert_eq!(started.status, ProjectStatus::Running);
    assert_eq!(h.services.count(&format!("start {}", unit(project.id))), 1);
}

#[tokio::test]
async fn test_static_project_has_no_service() {
    let h = Harness::new().await;
    let project = h.create(h.new_project("docs")).await;
    assert_eq!(project.port, 0);

    h.build_and_settle(project.id).await;
    assert_eq!(
        h.orchestrator.get_project(project.id).await.unwrap().status,
        ProjectStatus::Running
    );
    assert!(h.services.calls().is_empty());

    assert!(matches!(
        h.orchestrator.stop_project(project.id).await,
        Err(EngineError::ValidationError(_))
    ));
}

#[tokio::test]
async fn test_running_status_is_reconciled_on_read() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.start_command = "./server".to_string();
    let project = h.create(req).await;
    h.build_and_settle(project.id).await;

    h.services.set_active(false);
    assert_eq!(
        h.orchestrator.get_project(project.id).await.unwrap().status,
        ProjectStatus::Stopped
    );
    assert_eq!(
        h.orchestrator.list_projects().await.unwrap()[0].status,
        ProjectStatus::Stopped
    );
    // Not persisted
    assert_eq!(h.stored(project.id).await.status, ProjectStatus::Running);
}

// ================================ WEBHOOKS ======================================= //

#[tokio::test]
async fn test_webhook_gating() {
    let h = Harness::new().await;
    let project = h.create(h.new_project("hooked")).await;
    assert_eq!(project.webhook_token.len(), 64);

    // auto_deploy is off
    assert!(matches!(
        h.orchestrator.handle_webhook(&project.webhook_token).await,
        Err(EngineError::WebhookRejected)
    ));
    // unknown token
    assert!(matches!(
        h.orchestrator.handle_webhook("not-a-token").await,
        Err(EngineError::WebhookRejected)
    ));
    assert!(h
        .orchestrator
        .list_deployments(project.id)
        .await
        .unwrap()
        .is_empty());

    h.orchestrator
        .update_project(
            project.id,
            ProjectUpdate {
                auto_deploy: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let deployment = h
        .orchestrator
        .handle_webhook(&project.webhook_token)
        .await
        .unwrap();
    assert_eq!(deployment.build_num, 1);
    h.settle(project.id).await;

    // A regenerated token invalidates the old one
    let regenerated = h
        .orchestrator
        .regenerate_webhook_token(project.id)
        .await
        .unwrap();
    assert_ne!(regenerated.webhook_token, project.webhook_token);
    assert!(matches!(
        h.orchestrator.handle_webhook(&project.webhook_token).await,
        Err(EngineError::WebhookRejected)
    ));
    h.orchestrator
        .handle_webhook(&regenerated.webhook_token)
        .await
        .unwrap();
    h.settle(project.id).await;
    assert_eq!(h.orchestrator.list_deployments(project.id).await.unwrap().len(), 2);
}

// ============================ ROUTES AND DELETION ================================ //

#[tokio::test]
async fn test_route_registered_once() {
    let h = Harness::new().await;
    let mut req = h.new_project("web");
    req.start_command = "./server".to_string();
    req.domain = Some("web.example.com".to_string());
    let project = h.create(req).await;

    h.build_and_settle(project.id).await;
    let stored = h.stored(project.id).await;
    assert_eq!(stored.host_id, 42);
    assert_eq!(
        h.proxy.calls(),
        vec![
            format!("create web.example.com -> 127.0.0.1:{}", stored.port),
            "reload".to_string(),
        ]
    );

    h.build_and_settle(project.id).await;
    assert_eq!(h.proxy.calls().len(), 2);
}

#[tokio::test]
async fn test_delete_project_cascades() {
    let h = Harness::new().await;
    let mut req = h.new_project("web");
    req.start_command = "./server".to_string();
    req.domain = Some("web.example.com".to_string());
    let project = h.create(req).await;
    h.build_and_settle(project.id).await;
    assert!(h.layout.project_source_dir(project.id).exists().await);

    h.orchestrator.delete_project(project.id).await.unwrap();

    let calls = h.services.calls();
    assert!(calls.contains(&format!("stop {}", unit(project.id))));
    assert!(calls.contains(&format!("disable {}", unit(project.id))));
    assert!(calls.contains(&format!("remove {}", unit(project.id))));
    assert_eq!(
        h.proxy.calls()[2..],
        ["delete 42".to_string(), "reload".to_string()]
    );

    assert!(!h.layout.project_source_dir(project.id).exists().await);
    assert!(!h.layout.project_logs_dir(project.id).exists().await);
    assert!(matches!(
        h.orchestrator.get_project(project.id).await,
        Err(EngineError::NotFound(_))
    ));
    let id = project.id;
    let orphans = h
        .db
        .call(move |db| db.list_deployments(id))
        .await
        .unwrap();
    assert!(orphans.is_empty());
}

// ================================= RECOVERY ====================================== //

#[tokio::test]
async fn test_recover_interrupted_builds() {
    let h = Harness::new().await;
    let project = h.create(h.new_project("api")).await;
    let id = project.id;

    // What a crashed engine leaves behind
    h.db
        .call(move |db| db.begin_build(id, |n| format!("/nonexistent/build-{}.log", n)))
        .await
        .unwrap();
    assert_eq!(h.stored(id).await.status, ProjectStatus::Building);

    assert_eq!(h.orchestrator.recover_interrupted().await.unwrap(), 1);

    let stored = h.stored(id).await;
    assert_eq!(stored.status, ProjectStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    let deployment = &h.orchestrator.list_deployments(id).await.unwrap()[0];
    assert_eq!(deployment.status, DeploymentStatus::Failed);

    // Nothing left to recover
    assert_eq!(h.orchestrator.recover_interrupted().await.unwrap(), 0);
}

// =================================== LOGS ======================================== //

#[tokio::test]
async fn test_log_queries() {
    let h = Harness::new().await;
    let mut req = h.new_project("api");
    req.start_command = "./server".to_string();
    let project = h.create(req).await;

    assert_eq!(h.orchestrator.runtime_log(project.id, None).await.unwrap(), "");
    assert!(matches!(
        h.orchestrator.build_log(project.id, 1).await,
        Err(EngineError::NotFound(_))
    ));

    h.layout
        .runtime_log_file(project.id)
        .write_string("one\ntwo\nthree\n")
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.runtime_log(project.id, Some(2)).await.unwrap(),
        "two\nthree\n"
    );
    assert!(matches!(
        h.orchestrator.runtime_log(project.id + 100, None).await,
        Err(EngineError::NotFound(_))
    ));
}
