//! Orchestrator: project persistence, the build pipeline and lifecycle control

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{ProjectEvent, ProjectFsm, INTERRUPTED_MESSAGE};
use crate::deploy::git::SourceFetcher;
use crate::deploy::log_sink::{LogSink, LogSubscription};
use crate::deploy::ports::PortAllocator;
use crate::deploy::runner::BuildRunner;
use crate::deploy::supervisor::{ServiceManager, ServiceSupervisor};
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::{
    Deployment, DeploymentStatus, EnvVar, NewProject, Project, ProjectStatus, ProjectUpdate,
};
use crate::proxy::{HostRequest, ReverseProxy};
use crate::storage::db::DbHandle;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::generate_webhook_token;

/// Lines returned by `runtime_log` when the caller does not say
pub const DEFAULT_LOG_LINES: usize = 100;

/// Upper bound for `runtime_log`
pub const MAX_LOG_LINES: usize = 5000;

/// Tunables of the build pipeline
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_port: u16,
    pub build_timeout: Duration,
    pub start_grace: Duration,
    pub shell: String,
    pub unit_prefix: String,
    pub proxy_tls: bool,
    pub proxy_http_redirect: bool,
    pub proxy_websocket: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_port: 10000,
            build_timeout: Duration::from_secs(30 * 60),
            start_grace: Duration::from_secs(3),
            shell: "/bin/sh".to_string(),
            unit_prefix: "dockyard".to_string(),
            proxy_tls: true,
            proxy_http_redirect: true,
            proxy_websocket: true,
        }
    }
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            base_port: settings.engine.base_port,
            build_timeout: Duration::from_secs(settings.engine.build_timeout_secs),
            start_grace: Duration::from_secs(settings.engine.start_grace_secs),
            shell: settings.engine.shell.clone(),
            unit_prefix: settings.engine.unit_prefix.clone(),
            proxy_tls: settings.proxy.tls,
            proxy_http_redirect: settings.proxy.http_redirect,
            proxy_websocket: settings.proxy.websocket,
        }
    }
}

// ── Build locks ───────────────────────────────────────────────────────

/// Process-local set of projects with an operation in flight
#[derive(Debug, Clone, Default)]
pub struct BuildLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

impl BuildLocks {
    /// Take the lock for `project_id`, or `None` if it is already held
    pub fn try_acquire(&self, project_id: i64) -> Option<BuildGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(project_id) {
            return None;
        }
        Some(BuildGuard {
            locks: self.clone(),
            project_id,
        })
    }

    pub fn is_held(&self, project_id: i64) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&project_id)
    }
}

/// Releases the project's lock when dropped, including during unwinding
#[derive(Debug)]
pub struct BuildGuard {
    locks: BuildLocks,
    project_id: i64,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.project_id);
    }
}

type ActiveSinks = Arc<Mutex<HashMap<i64, Arc<LogSink>>>>;

/// Keeps a build's sink visible to live viewers; closes and unregisters it on drop
struct InFlight {
    sinks: ActiveSinks,
    project_id: i64,
    sink: Arc<LogSink>,
}

impl InFlight {
    fn register(sinks: &ActiveSinks, project_id: i64, sink: Arc<LogSink>) -> Self {
        sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id, sink.clone());
        Self {
            sinks: sinks.clone(),
            project_id,
            sink,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.sink.close();
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if sinks
            .get(&self.project_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.sink))
        {
            sinks.remove(&self.project_id);
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────

/// Coordinates fetch, build, supervision and route registration
pub struct Orchestrator {
    db: DbHandle,
    layout: StorageLayout,
    fetcher: SourceFetcher,
    runner: BuildRunner,
    supervisor: ServiceSupervisor,
    ports: PortAllocator,
    proxy: Arc<dyn ReverseProxy>,
    locks: BuildLocks,
    sinks: ActiveSinks,
    shutdown: CancellationToken,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        layout: StorageLayout,
        services: Arc<dyn ServiceManager>,
        proxy: Arc<dyn ReverseProxy>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let fetcher = SourceFetcher::new(layout.sources_dir(), layout.keys_dir().path());
        let supervisor = ServiceSupervisor::new(
            services,
            layout.clone(),
            config.shell.clone(),
            config.unit_prefix.clone(),
        );
        Self {
            db,
            fetcher,
            runner: BuildRunner::new(config.shell.clone()),
            supervisor,
            ports: PortAllocator::new(config.base_port),
            proxy,
            locks: BuildLocks::default(),
            sinks: Arc::default(),
            shutdown,
            layout,
            config,
        }
    }

    pub fn supervisor(&self) -> &ServiceSupervisor {
        &self.supervisor
    }

    /// Whether a build (or another exclusive operation) is in flight
    pub fn is_building(&self, project_id: i64) -> bool {
        self.locks.is_held(project_id)
    }

    /// Number of builds whose pipeline has not finished yet
    pub fn builds_in_flight(&self) -> usize {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock(&self, project_id: i64) -> Result<BuildGuard, EngineError> {
        self.locks
            .try_acquire(project_id)
            .ok_or(EngineError::AlreadyBuilding(project_id))
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Persist a new project with a fresh webhook token and, when it runs a
    /// process without a declared port, an allocated one
    pub async fn create_project(&self, req: NewProject) -> Result<Project, EngineError> {
        req.validate()?;
        let token = generate_webhook_token();
        let ports = self.ports;

        let project = self
            .db
            .call(move |db| {
                let id = db.insert_project(&req, &token)?;
                if !req.start_command.trim().is_empty() && req.port == 0 {
                    db.set_project_port(id, ports.allocate(id)?)?;
                }
                db.require_project(id)
            })
            .await?;

        info!("Created project {} ({})", project.id, project.name);
        Ok(project)
    }

    /// All projects, with `running` checked against the service manager
    pub async fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        let projects = self.db.call(|db| db.list_projects()).await?;
        let mut reconciled = Vec::with_capacity(projects.len());
        for project in projects {
            reconciled.push(self.reconcile(project).await);
        }
        Ok(reconciled)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project, EngineError> {
        let project = self.db.call(move |db| db.require_project(id)).await?;
        Ok(self.reconcile(project).await)
    }

    /// Stored `running` is downgraded to `stopped` when the unit is not active.
    /// The downgrade is not persisted.
    async fn reconcile(&self, mut project: Project) -> Project {
        if project.status == ProjectStatus::Running
            && !project.is_static()
            && !self.supervisor.is_running(project.id).await
        {
            project.status = ProjectStatus::Stopped;
        }
        project
    }

    pub async fn update_project(&self, id: i64, patch: ProjectUpdate) -> Result<Project, EngineError> {
        let _guard = self.lock(id)?;
        let ports = self.ports;
        let project = self
            .db
            .call(move |db| {
                let mut project = db.require_project(id)?;
                patch.apply(&mut project)?;
                if !project.is_static() && project.port == 0 {
                    project.port = ports.allocate(id)?;
                }
                db.save_project_config(&project)?;
                db.require_project(id)
            })
            .await?;
        info!("Updated project {}", id);
        Ok(self.reconcile(project).await)
    }

    pub async fn regenerate_webhook_token(&self, id: i64) -> Result<Project, EngineError> {
        let token = generate_webhook_token();
        let project = self
            .db
            .call(move |db| {
                db.require_project(id)?;
                db.set_webhook_token(id, &token)?;
                db.require_project(id)
            })
            .await?;
        info!("Regenerated webhook token for project {}", id);
        Ok(self.reconcile(project).await)
    }

    /// Remove the unit, working tree, logs, rows and any auto-created route
    pub async fn delete_project(&self, id: i64) -> Result<(), EngineError> {
        let _guard = self.lock(id)?;
        let project = self.db.call(move |db| db.require_project(id)).await?;

        self.supervisor.uninstall(id).await;
        self.db.call(move |db| db.delete_project(id)).await?;

        if let Err(e) = self.fetcher.project_dir(id).delete().await {
            warn!("Failed to delete sources of project {}: {}", id, e);
        }
        if let Err(e) = self.layout.project_logs_dir(id).delete().await {
            warn!("Failed to delete logs of project {}: {}", id, e);
        }

        if project.host_id > 0 {
            match self.proxy.delete_host(project.host_id).await {
                Ok(()) => {
                    if let Err(e) = self.proxy.reload().await {
                        warn!("Proxy reload after deleting route failed: {}", e);
                    }
                }
                Err(e) => warn!("Failed to delete route {}: {}", project.host_id, e),
            }
        }

        info!("Deleted project {} ({})", id, project.name);
        Ok(())
    }

    // ── Builds ────────────────────────────────────────────────────────

    /// Start a build and return its `building` deployment without waiting
    /// for the pipeline. Fails at once if the project is already busy.
    pub async fn build(self: &Arc<Self>, id: i64) -> Result<Deployment, EngineError> {
        let guard = self.lock(id)?;

        let layout = self.layout.clone();
        let (project, deployment) = self
            .db
            .call(move |db| {
                let project = db.require_project(id)?;
                let mut fsm = ProjectFsm::from_parts(project.status, project.error_message.clone());
                fsm.process(ProjectEvent::BuildStarted)?;
                let deployment = db.begin_build(id, |build_num| {
                    layout.build_log_file(id, build_num).path().display().to_string()
                })?;
                Ok((project, deployment))
            })
            .await?;

        let sink = match LogSink::open(std::path::Path::new(&deployment.log_path)).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                let message = format!("cannot open build log: {}", e);
                self.fail_build(id, deployment.id, 0, &message).await;
                return Err(e);
            }
        };
        let in_flight = InFlight::register(&self.sinks, id, sink.clone());
        info!("Build #{} of project {} started", deployment.build_num, id);

        let this = self.clone();
        let cancel = self.shutdown.child_token();
        let started = deployment.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _in_flight = in_flight;
            this.run_build(project, started, sink.clone(), cancel).await;
            // The lock is only released once the log is complete on disk.
            sink.finish().await;
        });

        Ok(deployment)
    }

    /// Body of the background build task
    async fn run_build(
        &self,
        project: Project,
        deployment: Deployment,
        sink: Arc<LogSink>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.config.build_timeout);
        tokio::pin!(deadline);

        let pipeline = self.pipeline(&project, &deployment, &sink, &cancel, started);
        tokio::pin!(pipeline);

        let result = tokio::select! {
            result = &mut pipeline => result,
            () = &mut deadline => {
                cancel.cancel();
                // Let the steps observe cancellation and reap their children.
                let _ = (&mut pipeline).await;
                Err(EngineError::Cancelled(format!(
                    "build timed out after {:?}",
                    self.config.build_timeout
                )))
            }
        };

        if let Err(e) = result {
            let message = e.to_string();
            sink.line(format!("Build failed: {}", message));
            let elapsed = started.elapsed().as_millis() as i64;
            self.fail_build(project.id, deployment.id, elapsed, &message)
                .await;
        }
    }

    /// Fetch, install, build, then bring the service up. Errors before the
    /// deployment settles fail the build; service errors are handled inside.
    async fn pipeline(
        &self,
        project: &Project,
        deployment: &Deployment,
        sink: &Arc<LogSink>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), EngineError> {
        sink.line(format!(
            "==> Build #{} of {} ({})",
            deployment.build_num, project.name, project.branch
        ));

        self.fetcher
            .fetch(
                cancel,
                &project.repo_url,
                &project.branch,
                project.deploy_key(),
                project.id,
                sink,
            )
            .await?;

        let commit = self.fetcher.commit_hash(project.id).await;
        if !commit.is_empty() {
            sink.line(format!("Checked out {}", commit));
            let deployment_id = deployment.id;
            self.db
                .call(move |db| db.set_deployment_commit(deployment_id, &commit))
                .await?;
        }

        let work_dir = self.fetcher.project_dir(project.id);
        write_env_file(&work_dir.file(".env"), &project.env_vars).await?;

        for (step, command) in [
            ("install", &project.install_command),
            ("build", &project.build_command),
        ] {
            if command.trim().is_empty() {
                sink.line(format!("==> No {} command, skipping", step));
                continue;
            }
            sink.line(format!("==> Running {} step", step));
            self.runner
                .run(cancel, work_dir.path(), command, &project.env_vars, sink)
                .await?;
        }

        let deployment_id = deployment.id;
        let elapsed = started.elapsed().as_millis() as i64;
        self.db
            .call(move |db| {
                db.finish_deployment(deployment_id, DeploymentStatus::Success, elapsed, None)
            })
            .await?;
        sink.line(format!("==> Build succeeded in {} ms", elapsed));
        info!(
            "Build #{} of project {} succeeded",
            deployment.build_num, project.id
        );

        self.activate(project, sink, cancel).await
    }

    /// Install and (re)start the unit, check it survives the grace period,
    /// then register a route. Only cancellation is returned as an error.
    async fn activate(
        &self,
        project: &Project,
        sink: &Arc<LogSink>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if project.is_static() {
            sink.line("==> Static project, nothing to start");
            self.transition(project.id, ProjectEvent::Deployed).await?;
            return Ok(());
        }

        let work_dir = self.fetcher.project_dir(project.id);
        sink.line(format!(
            "==> Starting {}",
            self.supervisor.unit_name(project.id)
        ));
        let started = match self.supervisor.install(project, work_dir.path()).await {
            Ok(()) => self.supervisor.restart(project.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            return self.service_failed(project.id, sink, e.to_string()).await;
        }

        tokio::select! {
            () = tokio::time::sleep(self.config.start_grace) => {}
            () = cancel.cancelled() => {
                return Err(EngineError::Cancelled("build cancelled".to_string()));
            }
        }

        if !self.supervisor.is_running(project.id).await {
            let message = format!(
                "process exited within {} ms of starting",
                self.config.start_grace.as_millis()
            );
            return self.service_failed(project.id, sink, message).await;
        }

        let project = self.transition(project.id, ProjectEvent::Deployed).await?;
        sink.line("==> Service is running");
        self.register_route(&project, sink).await;
        Ok(())
    }

    async fn service_failed(
        &self,
        project_id: i64,
        sink: &Arc<LogSink>,
        message: String,
    ) -> Result<(), EngineError> {
        error!("Service of project {} failed: {}", project_id, message);
        sink.line(format!("Service failed: {}", message));
        self.transition(project_id, ProjectEvent::ServiceFailed(message))
            .await?;
        Ok(())
    }

    /// Create the proxy route for a project's domain on its first successful start
    async fn register_route(&self, project: &Project, sink: &Arc<LogSink>) {
        let Some(domain) = project.domain.as_deref().filter(|d| !d.trim().is_empty()) else {
            return;
        };
        if !self.proxy.is_enabled() || project.host_id != 0 || project.port == 0 {
            return;
        }

        let host = HostRequest {
            domain: domain.to_string(),
            upstream: format!("127.0.0.1:{}", project.port),
            tls: self.config.proxy_tls,
            http_redirect: self.config.proxy_http_redirect,
            websocket: self.config.proxy_websocket,
        };
        let host_id = match self.proxy.create_host(&host).await {
            Ok(host_id) => host_id,
            Err(e) => {
                warn!("Failed to register route for {}: {}", domain, e);
                sink.line(format!("Could not register route for {}: {}", domain, e));
                return;
            }
        };

        let project_id = project.id;
        match self
            .db
            .call(move |db| db.set_host_id_once(project_id, host_id))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Project {} already had a route, host {} is extra", project_id, host_id),
            Err(e) => warn!("Failed to record route {} for project {}: {}", host_id, project_id, e),
        }

        if let Err(e) = self.proxy.reload().await {
            warn!("Proxy reload failed: {}", e);
            sink.line(format!("Proxy reload failed: {}", e));
            return;
        }
        sink.line(format!("==> Route registered: {} -> {}", host.domain, host.upstream));
    }

    /// Settle a deployment as failed (if still building) and move the project to `error`
    async fn fail_build(&self, project_id: i64, deployment_id: i64, elapsed_ms: i64, message: &str) {
        let error_message = message.to_string();
        let settled = self
            .db
            .call(move |db| {
                db.finish_deployment(
                    deployment_id,
                    DeploymentStatus::Failed,
                    elapsed_ms,
                    Some(&error_message),
                )
            })
            .await;
        if let Err(e) = settled {
            error!("Failed to record failed deployment {}: {}", deployment_id, e);
        }

        warn!("Build of project {} failed: {}", project_id, message);
        match self
            .transition(project_id, ProjectEvent::BuildFailed(message.to_string()))
            .await
        {
            Ok(_) => {}
            // The service step already settled the project.
            Err(EngineError::ValidationError(e)) => debug!("Not marking project {} failed: {}", project_id, e),
            Err(e) => error!("Failed to mark project {} failed: {}", project_id, e),
        }
    }

    /// Apply `event` to the stored status and persist the result
    async fn transition(&self, project_id: i64, event: ProjectEvent) -> Result<Project, EngineError> {
        self.db
            .call(move |db| {
                let mut project = db.require_project(project_id)?;
                let mut fsm = ProjectFsm::from_parts(project.status, project.error_message.clone());
                fsm.process(event)?;
                db.set_project_status(project_id, fsm.state(), fsm.error())?;
                project.status = fsm.state();
                project.error_message = fsm.error().map(str::to_owned);
                Ok(project)
            })
            .await
    }

    // ── Service control ───────────────────────────────────────────────

    pub async fn start_project(&self, id: i64) -> Result<Project, EngineError> {
        let _guard = self.lock(id)?;
        let project = self.runnable(id, ProjectEvent::Started).await?;

        if let Err(e) = self.supervisor.start(project.id).await {
            self.transition(id, ProjectEvent::ServiceFailed(e.to_string()))
                .await?;
            return Err(e);
        }
        info!("Started project {}", id);
        self.transition(id, ProjectEvent::Started).await
    }

    pub async fn stop_project(&self, id: i64) -> Result<Project, EngineError> {
        let _guard = self.lock(id)?;
        let project = self.runnable(id, ProjectEvent::Stopped).await?;

        self.supervisor.stop(project.id).await?;
        info!("Stopped project {}", id);
        self.transition(id, ProjectEvent::Stopped).await
    }

    /// Load a project that has a service and accepts `event` in its current state
    async fn runnable(&self, id: i64, event: ProjectEvent) -> Result<Project, EngineError> {
        let project = self.db.call(move |db| db.require_project(id)).await?;
        if project.is_static() {
            return Err(EngineError::ValidationError(
                "project has no start command".to_string(),
            ));
        }
        ProjectFsm::from_parts(project.status, project.error_message.clone()).process(event)?;
        Ok(project)
    }

    /// Make `target` the current build again and restart the service.
    /// Sources are not re-fetched: the working tree stays as last built.
    pub async fn rollback(&self, id: i64, target: i64) -> Result<Project, EngineError> {
        let _guard = self.lock(id)?;

        let (project, deployment) = self
            .db
            .call(move |db| {
                let project = db.require_project(id)?;
                let deployment = db.find_deployment(id, target)?;
                Ok((project, deployment))
            })
            .await?;

        match deployment {
            Some(d) if d.status == DeploymentStatus::Success => {}
            Some(d) => {
                return Err(EngineError::InvalidRollback(format!(
                    "build #{} is {}, not success",
                    target,
                    d.status.as_str()
                )));
            }
            None => {
                return Err(EngineError::InvalidRollback(format!(
                    "project {} has no build #{}",
                    id, target
                )));
            }
        }
        ProjectFsm::from_parts(project.status, project.error_message.clone())
            .process(ProjectEvent::RolledBack)?;

        let rolled_back = self.db.call(move |db| db.rollback_to(id, target)).await?;
        info!(
            "Rolled project {} back to build #{} ({} later builds marked rolled back)",
            id, target, rolled_back
        );

        if !project.is_static() {
            if let Err(e) = self.supervisor.restart(id).await {
                self.transition(id, ProjectEvent::ServiceFailed(e.to_string()))
                    .await?;
                return Err(e);
            }
        }
        self.transition(id, ProjectEvent::RolledBack).await
    }

    // ── Webhooks ──────────────────────────────────────────────────────

    /// Build the project owning `token`, if it accepts webhook builds.
    /// Unknown tokens and disabled projects are indistinguishable to the caller.
    pub async fn handle_webhook(self: &Arc<Self>, token: &str) -> Result<Deployment, EngineError> {
        let token = token.to_string();
        let project = self
            .db
            .call(move |db| db.find_project_by_webhook_token(&token))
            .await?
            .ok_or(EngineError::WebhookRejected)?;
        info!("Webhook accepted for project {}", project.id);
        self.build(project.id).await
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Deployments of a project, newest first
    pub async fn list_deployments(&self, id: i64) -> Result<Vec<Deployment>, EngineError> {
        self.db
            .call(move |db| {
                db.require_project(id)?;
                db.list_deployments(id)
            })
            .await
    }

    /// Persisted output of one build; empty if the file is gone
    pub async fn build_log(&self, id: i64, build_num: i64) -> Result<String, EngineError> {
        let deployment = self
            .db
            .call(move |db| db.find_deployment(id, build_num))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("build #{} of project {}", build_num, id)))?;
        File::new(deployment.log_path).read_string_or_empty().await
    }

    /// Tail of the service's output. `lines` defaults to 100, capped at 5000.
    pub async fn runtime_log(&self, id: i64, lines: Option<usize>) -> Result<String, EngineError> {
        self.db.call(move |db| db.require_project(id)).await?;
        let lines = lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
        self.supervisor.read_runtime_log(id, lines).await
    }

    /// Live output of the build in flight
    pub fn subscribe_build_log(&self, id: i64) -> Result<(Arc<LogSink>, LogSubscription), EngineError> {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let sink = sinks
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("no build in progress for project {}", id)))?;
        let subscription = sink.subscribe();
        Ok((sink, subscription))
    }

    // ── Recovery ──────────────────────────────────────────────────────

    /// Fail builds a previous engine process left unfinished. Call before serving.
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let failed = self
            .db
            .call(|db| db.fail_unfinished_deployments(INTERRUPTED_MESSAGE))
            .await?;

        let projects = self.db.call(|db| db.list_projects()).await?;
        let mut recovered = 0;
        for project in projects
            .into_iter()
            .filter(|p| p.status == ProjectStatus::Building)
        {
            self.transition(project.id, ProjectEvent::Interrupted).await?;
            recovered += 1;
        }

        if failed > 0 || recovered > 0 {
            warn!(
                "Recovered {} interrupted deployments across {} projects",
                failed, recovered
            );
        }
        Ok(recovered)
    }
}

/// Write the project's variables as a `.env` file, readable by the owner only
async fn write_env_file(file: &File, vars: &[EnvVar]) -> Result<(), EngineError> {
    if vars.is_empty() {
        return Ok(());
    }
    let mut contents = String::new();
    for var in vars {
        let value = var.value.replace('\\', "\\\\").replace('"', "\\\"");
        contents.push_str(&format!("{}=\"{}\"\n", var.key, value));
    }
    file.write_private(&contents).await
}
