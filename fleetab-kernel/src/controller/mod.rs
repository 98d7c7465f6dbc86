/**
 * EXPERIMENT CONTROLLER - Machine à états des expériences
 *
 * RÔLE : Pending -> Deploying -> Running -> Analyzing -> Succeeded/Failed -> Promoted/RolledBack.
 * Transforme une déclaration d'expérience en tâches par hôte et décide des transitions.
 *
 * FONCTIONNEMENT :
 * - Chaque évaluation relit l'état persisté (tâches, pipelines, heartbeats), jamais de compteur volatile
 * - Écriture conditionnelle sur la version : deux évaluations concurrentes, une seule gagne
 * - Enqueue protégé par l'unicité (expérience, hôte, variante, type) du store
 * - Boucle : tick périodique + réveil sur tout changement de statut de tâche
 */

pub mod progress;
pub mod selector;
mod teardown;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::SharedAgentRegistry;
use crate::analysis::{self, MetricInput};
use crate::config::KernelConfig;
use crate::events::{EventBus, ExperimentEvent};
use crate::metrics::{
    flatten_series, with_retry, BackendError, MetricsBackend, RangeQuery, RetryPolicy, LABEL_EXPERIMENT, LABEL_VARIANT,
};
use crate::models::{
    Cohort, ConfigRef, Experiment, ExperimentDesign, ExperimentState, HostId, HostSelector, Liveness, NewExperiment,
    NewTask, PipelineRole, PipelineStatus, Recommendation, ResultSummary, TaskKind, TaskPayload, Variant,
};
use crate::store::{Store, StoreError};

use progress::{deploy_progress, quorum_count};

/// Garde-fou contre une boucle de transitions
const MAX_STEPS_PER_EVALUATION: usize = 8;
const OPERATOR_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("experiment {0} not found")]
    NotFound(String),

    #[error("invalid experiment: {0}")]
    Validation(String),

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("experiment {id} is {state:?}, cannot {operation}")]
    InvalidState {
        id: String,
        state: ExperimentState,
        operation: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Controller {
    store: Arc<Store>,
    agents: SharedAgentRegistry,
    backend: Arc<dyn MetricsBackend>,
    events: EventBus,
    config: Arc<KernelConfig>,
}

fn secs(value: u64) -> time::Duration {
    time::Duration::seconds(value.min(i64::MAX as u64) as i64)
}

impl Controller {
    pub fn new(
        store: Arc<Store>,
        agents: SharedAgentRegistry,
        backend: Arc<dyn MetricsBackend>,
        events: EventBus,
        config: Arc<KernelConfig>,
    ) -> Self {
        Self { store, agents, backend, events, config }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.config.metrics.retry_attempts.max(1), ..RetryPolicy::default() }
    }

    // ---------------------------------------------------------------------
    // Surface de gestion
    // ---------------------------------------------------------------------

    pub fn create(&self, request: NewExperiment) -> Result<Experiment, ControllerError> {
        let defaults = &self.config.controller;
        let quorum = request.quorum.unwrap_or(defaults.default_quorum);
        let alpha = request.alpha.unwrap_or(defaults.default_alpha);
        let durations = request.durations.unwrap_or(defaults.default_durations);

        validate(&request, quorum, alpha, durations.observation_window_secs)?;

        // secrets manquants : refus avant toute tâche
        let configs = [Some(&request.baseline), Some(&request.candidate), request.load_sim.as_ref()];
        for name in configs.iter().flatten().flat_map(|c| c.required_credentials.iter()) {
            if self.config.credential(name).is_none() {
                return Err(ControllerError::MissingCredential(name.clone()));
            }
        }

        let now = OffsetDateTime::now_utc();
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            baseline: request.baseline,
            candidate: request.candidate,
            selector: request.selector,
            design: request.design,
            load_sim: request.load_sim,
            metrics: request.metrics,
            quorum,
            alpha,
            durations,
            auto_decide: request.auto_decide,
            priority: request.priority,
            state: ExperimentState::Pending,
            targets: vec![],
            cohort: None,
            excluded: Default::default(),
            diagnostics: vec![],
            result: None,
            created_at: now,
            updated_at: now,
            deploying_since: None,
            running_since: None,
            analyzing_since: None,
            decided_at: None,
            version: 0,
        };

        let experiment = self.store.experiments.insert(experiment)?;
        info!("[controller] experiment {} ({}) created", experiment.id, experiment.name);
        self.events.publish(ExperimentEvent {
            experiment_id: experiment.id.clone(),
            from: None,
            to: ExperimentState::Pending,
            at: now,
            detail: Some(experiment.name.clone()),
        });
        self.store.tasks.changes().notify_waiters();
        Ok(experiment)
    }

    pub fn get(&self, id: &str) -> Result<Experiment, ControllerError> {
        self.store.experiments.get(id).ok_or_else(|| ControllerError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Experiment> {
        self.store.experiments.list()
    }

    /// Arrêt opérateur : tâches Pending annulées, Stop pour ce qui tourne, expérience Failed
    pub fn stop(&self, id: &str) -> Result<Experiment, ControllerError> {
        self.operator_transition(id, "stop", ExperimentState::Failed, Some("stopped by operator"), |s| s.is_active())
            .map(|experiment| {
                self.wind_down(&experiment, None, OffsetDateTime::now_utc());
                experiment
            })
    }

    pub fn promote(&self, id: &str) -> Result<Experiment, ControllerError> {
        self.operator_transition(id, "promote", ExperimentState::Promoted, Some("promoted by operator"), |s| {
            s == ExperimentState::Succeeded
        })
        .map(|experiment| {
            self.teardown_promoted(&experiment, OffsetDateTime::now_utc());
            experiment
        })
    }

    pub fn rollback(&self, id: &str) -> Result<Experiment, ControllerError> {
        self.operator_transition(id, "roll back", ExperimentState::RolledBack, Some("rolled back by operator"), |s| {
            matches!(s, ExperimentState::Succeeded | ExperimentState::Failed)
        })
        .map(|experiment| {
            self.wind_down(&experiment, None, OffsetDateTime::now_utc());
            experiment
        })
    }

    fn operator_transition<P>(
        &self,
        id: &str,
        operation: &'static str,
        to: ExperimentState,
        detail: Option<&str>,
        allowed: P,
    ) -> Result<Experiment, ControllerError>
    where
        P: Fn(ExperimentState) -> bool,
    {
        let mut last_version = 0;
        for _ in 0..OPERATOR_RETRIES {
            let current = self.get(id)?;
            if !allowed(current.state) {
                return Err(ControllerError::InvalidState { id: id.to_string(), state: current.state, operation });
            }
            last_version = current.version;
            let now = OffsetDateTime::now_utc();
            if let Some(updated) = self.transition(&current, to, now, detail.map(str::to_string), |e| {
                if matches!(to, ExperimentState::Promoted | ExperimentState::RolledBack) {
                    e.decided_at = Some(now);
                }
            })? {
                return Ok(updated);
            }
        }
        Err(ControllerError::Store(StoreError::Conflict {
            id: id.to_string(),
            expected: last_version,
            actual: last_version + 1,
        }))
    }

    // ---------------------------------------------------------------------
    // Évaluation
    // ---------------------------------------------------------------------

    /// Évalue une expérience jusqu'à stabilité ; retourne le dernier état atteint s'il a changé
    pub async fn evaluate_at(&self, id: &str, now: OffsetDateTime) -> Result<Option<ExperimentState>, ControllerError> {
        let mut reached = None;
        for _ in 0..MAX_STEPS_PER_EVALUATION {
            let experiment = self.get(id)?;
            match self.step(&experiment, now).await? {
                Some(state) => reached = Some(state),
                None => break,
            }
        }
        Ok(reached)
    }

    pub async fn evaluate(&self, id: &str) -> Result<Option<ExperimentState>, ControllerError> {
        self.evaluate_at(id, OffsetDateTime::now_utc()).await
    }

    /// Toutes les expériences encore pilotées ; retourne le nombre de transitions
    pub async fn evaluate_all(&self, now: OffsetDateTime) -> usize {
        let mut transitions = 0;
        for experiment in self.store.experiments.list() {
            let driven = experiment.state.is_active()
                || (experiment.state == ExperimentState::Succeeded && experiment.auto_decide);
            if !driven {
                continue;
            }
            match self.evaluate_at(&experiment.id, now).await {
                Ok(Some(_)) => transitions += 1,
                Ok(None) => {}
                Err(e) => error!("[controller] evaluation of {} failed: {}", experiment.id, e),
            }
        }
        transitions
    }

    pub fn spawn_loop(controller: Arc<Controller>) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(controller.config.controller.evaluation_interval_secs.max(1));
        let changes = controller.store.tasks.changes();
        info!("[controller] evaluation loop started (every {:?})", every);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = changes.notified() => {}
                }
                controller.evaluate_all(OffsetDateTime::now_utc()).await;
            }
        })
    }

    async fn step(&self, experiment: &Experiment, now: OffsetDateTime) -> Result<Option<ExperimentState>, ControllerError> {
        let next = match experiment.state {
            ExperimentState::Pending => self.start_deploying(experiment, now)?,
            ExperimentState::Deploying => self.evaluate_deploying(experiment, now)?,
            ExperimentState::Running => self.evaluate_running(experiment, now)?,
            ExperimentState::Analyzing => self.evaluate_analyzing(experiment, now).await?,
            ExperimentState::Succeeded if experiment.auto_decide => self.auto_decide(experiment, now)?,
            _ => None,
        };
        Ok(next.map(|e| e.state))
    }

    /// Écriture conditionnelle d'une transition ; None si une autre évaluation a gagné
    fn transition<F>(
        &self,
        experiment: &Experiment,
        to: ExperimentState,
        now: OffsetDateTime,
        detail: Option<String>,
        mutate: F,
    ) -> Result<Option<Experiment>, ControllerError>
    where
        F: FnOnce(&mut Experiment),
    {
        let from = experiment.state;
        let result = self.store.experiments.update_if(&experiment.id, experiment.version, |e| {
            mutate(e);
            e.state = to;
            e.updated_at = now;
            if to == ExperimentState::Failed {
                if let Some(message) = &detail {
                    e.diagnose(now, None, message.clone());
                }
            }
        });

        match result {
            Ok(updated) => {
                match (&detail, to) {
                    (Some(d), ExperimentState::Failed) => {
                        warn!("[controller] experiment {} {:?} -> {:?}: {}", updated.id, from, to, d)
                    }
                    _ => info!("[controller] experiment {} {:?} -> {:?}", updated.id, from, to),
                }
                self.events.publish(ExperimentEvent {
                    experiment_id: updated.id.clone(),
                    from: Some(from),
                    to,
                    at: now,
                    detail,
                });
                Ok(Some(updated))
            }
            Err(StoreError::Conflict { .. }) => {
                debug!("[controller] concurrent evaluation won for {}", experiment.id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mutation sans changement d'état (exclusions, diagnostics)
    fn save<F>(&self, experiment: &Experiment, now: OffsetDateTime, mutate: F) -> Result<Option<Experiment>, ControllerError>
    where
        F: FnOnce(&mut Experiment),
    {
        match self.store.experiments.update_if(&experiment.id, experiment.version, |e| {
            mutate(e);
            e.updated_at = now;
        }) {
            Ok(updated) => Ok(Some(updated)),
            Err(StoreError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fail(
        &self,
        experiment: &Experiment,
        now: OffsetDateTime,
        message: String,
        exclusions: &[(HostId, String)],
    ) -> Result<Option<Experiment>, ControllerError> {
        let failed = self.transition(experiment, ExperimentState::Failed, now, Some(message), |e| {
            for (host, reason) in exclusions {
                e.exclude_host(now, host, reason.clone());
            }
        })?;
        if let Some(failed) = &failed {
            self.wind_down(failed, None, now);
        }
        Ok(failed)
    }

    // --- Pending -> Deploying ---

    fn start_deploying(&self, experiment: &Experiment, now: OffsetDateTime) -> Result<Option<Experiment>, ControllerError> {
        let agents = self.agents.list(now);
        let hosts = selector::resolve_hosts(&experiment.selector, &agents);
        if hosts.is_empty() {
            return self.fail(experiment, now, "no hosts matched the selector".into(), &[]);
        }
        if experiment.design == ExperimentDesign::Split && hosts.len() < 2 {
            return self.fail(
                experiment,
                now,
                format!("split design needs at least 2 hosts, selector matched {}", hosts.len()),
                &[],
            );
        }

        let targets = selector::assign(&hosts, experiment.design);
        let detail = format!("{} target host(s)", hosts.len());
        self.transition(experiment, ExperimentState::Deploying, now, Some(detail), move |e| {
            e.targets = targets;
            e.deploying_since = Some(now);
        })
    }

    // --- Deploying ---

    fn evaluate_deploying(&self, experiment: &Experiment, now: OffsetDateTime) -> Result<Option<Experiment>, ControllerError> {
        let tasks = self.store.tasks.for_experiment(&experiment.id);
        let progress = deploy_progress(experiment, &tasks);

        for (host, variant, kind, attempt) in &progress.to_enqueue {
            self.enqueue_start(experiment, host, *variant, *kind, *attempt, now)?;
        }

        let newly_failed: Vec<(HostId, String)> = progress
            .failed_hosts()
            .into_iter()
            .filter(|(h, _)| !experiment.excluded.contains_key(h))
            .collect();

        let total = experiment.target_hosts().len();
        let needed = quorum_count(total, experiment.quorum);
        let succeeded = progress.succeeded();
        let unresolved = progress.unresolved_hosts();

        if succeeded + unresolved.len() < needed {
            return self.fail(
                experiment,
                now,
                quorum_message("quorum unreachable", succeeded, total, needed, &progress.failed_hosts()),
                &newly_failed,
            );
        }

        let deadline = experiment.deploying_since.unwrap_or(experiment.created_at)
            + secs(experiment.durations.deploy_timeout_secs);
        let timed_out = now >= deadline;

        if !unresolved.is_empty() && !timed_out {
            if !newly_failed.is_empty() {
                self.save(experiment, now, |e| {
                    for (host, reason) in &newly_failed {
                        e.exclude_host(now, host, reason.clone());
                    }
                })?;
            }
            return Ok(None);
        }

        if succeeded < needed {
            return self.fail(
                experiment,
                now,
                quorum_message("quorum not reached within deploy timeout", succeeded, total, needed, &progress.failed_hosts()),
                &newly_failed,
            );
        }

        let cohort = cohort_of(experiment, &progress);
        if let Some(empty) = Variant::all().into_iter().find(|v| cohort.hosts(*v).is_empty()) {
            return self.fail(
                experiment,
                now,
                format!("no deployed host left for the {} variant", empty.as_str()),
                &newly_failed,
            );
        }

        let detail = format!("cohort of {} host(s), {} excluded", cohort.host_count(), total - cohort.host_count());
        let running = self.transition(experiment, ExperimentState::Running, now, Some(detail), |e| {
            for (host, reason) in &newly_failed {
                e.exclude_host(now, host, reason.clone());
            }
            for host in &unresolved {
                e.exclude_host(now, host, "deploy timeout".to_string());
            }
            e.cohort = Some(cohort);
            e.running_since = Some(now);
        })?;

        if let Some(running) = &running {
            if !unresolved.is_empty() {
                self.wind_down(running, Some(unresolved.as_slice()), now);
            }
        }
        Ok(running)
    }

    // --- Running ---

    fn evaluate_running(&self, experiment: &Experiment, now: OffsetDateTime) -> Result<Option<Experiment>, ControllerError> {
        let cohort = experiment.cohort.clone().unwrap_or_default();
        let pipelines = self.store.pipelines.for_experiment(&experiment.id);

        let mut hosts: Vec<&HostId> = cohort.baseline.iter().chain(cohort.candidate.iter()).collect();
        hosts.sort();
        hosts.dedup();

        let mut lost: Vec<(HostId, String)> = Vec::new();
        for host in hosts {
            if self.agents.liveness(host, now) == Liveness::Lost {
                lost.push((host.clone(), "agent lost (no heartbeat)".to_string()));
            } else if let Some(p) = pipelines
                .iter()
                .find(|p| &p.host_id == host && p.status == PipelineStatus::Failed)
            {
                lost.push((
                    host.clone(),
                    format!("{:?} {} pipeline failed after {} restart(s)", p.role, p.variant.as_str(), p.restarts),
                ));
            }
        }

        let mut current = experiment.clone();
        if !lost.is_empty() {
            let mut remaining = cohort.clone();
            for (host, _) in &lost {
                remaining.remove_host(host);
            }
            let total = experiment.target_hosts().len();
            let needed = quorum_count(total, experiment.quorum);
            let variant_empty = Variant::all().into_iter().any(|v| remaining.hosts(v).is_empty());

            if remaining.host_count() < needed || variant_empty {
                let failed_hosts: Vec<(HostId, String)> = lost.clone();
                return self.fail(
                    experiment,
                    now,
                    quorum_message("cohort fell below quorum", remaining.host_count(), total, needed, &failed_hosts),
                    &lost,
                );
            }

            let Some(saved) = self.save(experiment, now, |e| {
                for (host, reason) in &lost {
                    e.exclude_host(now, host, reason.clone());
                }
            })?
            else {
                return Ok(None);
            };
            let excluded: Vec<HostId> = lost.iter().map(|(h, _)| h.clone()).collect();
            self.wind_down(&saved, Some(excluded.as_slice()), now);
            current = saved;
        }

        let window_end = current.running_since.unwrap_or(current.created_at)
            + secs(current.durations.observation_window_secs);
        if now < window_end {
            return Ok(None);
        }
        self.transition(&current, ExperimentState::Analyzing, now, Some("observation window elapsed".into()), |e| {
            e.analyzing_since = Some(now);
        })
    }

    // --- Analyzing ---

    async fn fetch_samples(
        &self,
        experiment: &Experiment,
        metric: &str,
        variant: Variant,
        hosts: &[HostId],
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<f64>, BackendError> {
        // une cohorte vide ne doit jamais devenir "tous les hôtes"
        if hosts.is_empty() {
            return Ok(vec![]);
        }
        let mut labels = std::collections::BTreeMap::new();
        labels.insert(LABEL_EXPERIMENT.to_string(), experiment.id.clone());
        labels.insert(LABEL_VARIANT.to_string(), variant.as_str().to_string());
        let query = RangeQuery {
            metric: metric.to_string(),
            labels,
            hosts: hosts.to_vec(),
            start,
            end,
            step_secs: self.config.metrics.query_step_secs,
        };
        let backend = self.backend.clone();
        let series = with_retry(self.retry_policy(), "query_range", || {
            let backend = backend.clone();
            let query = &query;
            async move { backend.query_range(query).await }
        })
        .await?;
        Ok(flatten_series(series))
    }

    async fn evaluate_analyzing(
        &self,
        experiment: &Experiment,
        now: OffsetDateTime,
    ) -> Result<Option<Experiment>, ControllerError> {
        let window_start = experiment.running_since.unwrap_or(experiment.created_at);
        let window_end = window_start + secs(experiment.durations.observation_window_secs);
        if now < window_end + secs(experiment.durations.grace_period_secs) {
            return Ok(None);
        }

        let cohort = experiment.cohort.clone().unwrap_or_default();
        let mut inputs = Vec::with_capacity(experiment.metrics.len());
        for goal in &experiment.metrics {
            let mut sets: Vec<Vec<f64>> = Vec::with_capacity(2);
            for variant in Variant::all() {
                match self
                    .fetch_samples(experiment, &goal.name, variant, cohort.hosts(variant), window_start, window_end)
                    .await
                {
                    Ok(values) => sets.push(values),
                    Err(e) if e.is_transient() => {
                        warn!("[controller] metrics backend unavailable for {} ({}), staying in Analyzing", experiment.id, e);
                        return Ok(None);
                    }
                    Err(e) => {
                        return self.fail(experiment, now, format!("metrics query for {} failed: {}", goal.name, e), &[]);
                    }
                }
            }
            let candidate = sets.pop().unwrap_or_default();
            let baseline = sets.pop().unwrap_or_default();
            inputs.push(MetricInput { goal: goal.clone(), baseline, candidate });
        }

        let results = analysis::analyze_metrics(&inputs, experiment.alpha);
        let usable = analysis::is_usable(&results);
        let summary = ResultSummary {
            recommendation: analysis::recommend(&results),
            usable,
            alpha: experiment.alpha,
            metrics: results,
            window_start,
            window_end,
        };

        if usable {
            let detail = format!("recommendation: {:?}", summary.recommendation);
            return self.transition(experiment, ExperimentState::Succeeded, now, Some(detail), move |e| {
                e.result = Some(summary);
            });
        }

        let reasons: Vec<String> = summary
            .metrics
            .iter()
            .filter_map(|m| match &m.outcome {
                analysis::AnalysisOutcome::Inconclusive { reason } => Some(format!("{}: {}", m.metric, reason)),
                _ => None,
            })
            .collect();
        let message = format!("analysis inconclusive ({})", reasons.join("; "));
        let failed = self.transition(experiment, ExperimentState::Failed, now, Some(message), move |e| {
            e.result = Some(summary);
        })?;
        if let Some(failed) = &failed {
            self.wind_down(failed, None, now);
        }
        Ok(failed)
    }

    // --- Succeeded (auto_decide) ---

    fn auto_decide(&self, experiment: &Experiment, now: OffsetDateTime) -> Result<Option<Experiment>, ControllerError> {
        let recommendation = experiment
            .result
            .as_ref()
            .map(|r| r.recommendation)
            .unwrap_or(Recommendation::NoChange);

        if recommendation == Recommendation::Promote {
            let promoted = self.transition(experiment, ExperimentState::Promoted, now, Some("promoted by policy".into()), |e| {
                e.decided_at = Some(now);
            })?;
            if let Some(promoted) = &promoted {
                self.teardown_promoted(promoted, now);
            }
            return Ok(promoted);
        }

        let detail = format!("rolled back by policy ({recommendation:?})");
        let rolled_back = self.transition(experiment, ExperimentState::RolledBack, now, Some(detail), |e| {
            e.decided_at = Some(now);
        })?;
        if let Some(rolled_back) = &rolled_back {
            self.wind_down(rolled_back, None, now);
        }
        Ok(rolled_back)
    }

    // ---------------------------------------------------------------------
    // Tâches
    // ---------------------------------------------------------------------

    /// Payload d'un pipeline : config de la variante (ou du load-sim) + variables standard + secrets
    fn payload_for(&self, experiment: &Experiment, host: &str, variant: Variant, config: &ConfigRef) -> TaskPayload {
        let mut overrides = config.overrides.clone();
        overrides.entry("experiment_id".into()).or_insert_with(|| experiment.id.clone());
        overrides.entry("variant".into()).or_insert_with(|| variant.as_str().to_string());
        overrides.entry("host_id".into()).or_insert_with(|| host.to_string());
        for name in &config.required_credentials {
            match self.config.credential(name) {
                Some(secret) => {
                    overrides.insert(name.clone(), secret);
                }
                None => warn!("[controller] credential {} vanished since experiment creation", name),
            }
        }
        TaskPayload {
            config_url: Some(config.config_url.clone()),
            overrides,
            command: config.command.clone(),
            self_metrics_url: config.self_metrics_url.clone(),
            metrics: experiment.metrics.iter().map(|m| m.name.clone()).collect(),
        }
    }

    fn enqueue(
        &self,
        experiment: &Experiment,
        host: &str,
        variant: Variant,
        kind: TaskKind,
        payload: TaskPayload,
        attempt: u32,
        now: OffsetDateTime,
    ) -> Result<(), ControllerError> {
        let draft = NewTask {
            experiment_id: experiment.id.clone(),
            host_id: host.to_string(),
            variant,
            kind,
            payload,
            priority: experiment.priority,
            attempt,
            max_attempts: self.config.controller.max_task_attempts.max(1),
        };
        match self.store.tasks.enqueue(draft, now) {
            Ok(_) | Err(StoreError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn enqueue_start(
        &self,
        experiment: &Experiment,
        host: &str,
        variant: Variant,
        kind: TaskKind,
        attempt: u32,
        now: OffsetDateTime,
    ) -> Result<(), ControllerError> {
        let config = match kind.role() {
            PipelineRole::Collector => Some(experiment.config_for(variant)),
            PipelineRole::LoadSim => experiment.load_sim.as_ref(),
        };
        let Some(config) = config else { return Ok(()) };
        let payload = self.payload_for(experiment, host, variant, config);
        if attempt > 1 {
            info!("[controller] retrying {:?} for {} on {} (attempt {})", kind, experiment.id, host, attempt);
        }
        self.enqueue(experiment, host, variant, kind, payload, attempt, now)
    }
}

fn validate(request: &NewExperiment, quorum: f64, alpha: f64, window_secs: u64) -> Result<(), ControllerError> {
    let invalid = |msg: &str| Err(ControllerError::Validation(msg.to_string()));
    if request.name.trim().is_empty() {
        return invalid("name must not be empty");
    }
    if request.baseline.config_url.trim().is_empty() || request.candidate.config_url.trim().is_empty() {
        return invalid("baseline and candidate config_url are required");
    }
    if let Some(load_sim) = &request.load_sim {
        if load_sim.config_url.trim().is_empty() {
            return invalid("load_sim config_url must not be empty");
        }
    }
    if !(quorum > 0.0 && quorum <= 1.0) {
        return invalid("quorum must be in (0, 1]");
    }
    if !(alpha > 0.0 && alpha < 1.0) {
        return invalid("alpha must be in (0, 1)");
    }
    if request.metrics.is_empty() || request.metrics.iter().any(|m| m.name.trim().is_empty()) {
        return invalid("at least one named metric is required");
    }
    if let HostSelector::Hosts { hosts } = &request.selector {
        if hosts.iter().all(|h| h.trim().is_empty()) {
            return invalid("explicit host list must not be empty");
        }
    }
    if window_secs == 0 {
        return invalid("observation window must be positive");
    }
    Ok(())
}

fn cohort_of(experiment: &Experiment, progress: &progress::DeployProgress) -> Cohort {
    let mut cohort = Cohort::default();
    for assignment in &experiment.targets {
        if progress.hosts.get(&assignment.host_id) != Some(&progress::HostOutcome::Succeeded) {
            continue;
        }
        match assignment.variant {
            Variant::Baseline => cohort.baseline.push(assignment.host_id.clone()),
            Variant::Candidate => cohort.candidate.push(assignment.host_id.clone()),
        }
    }
    cohort
}

fn quorum_message(prefix: &str, succeeded: usize, total: usize, needed: usize, failed: &[(HostId, String)]) -> String {
    let mut message = format!("{prefix}: {succeeded}/{total} host(s) healthy, {needed} required");
    if !failed.is_empty() {
        let hosts: Vec<String> = failed.iter().map(|(h, r)| format!("{h} ({r})")).collect();
        message.push_str(&format!("; failed hosts: {}", hosts.join(", ")));
    }
    message
}
