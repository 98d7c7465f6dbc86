/**
 * TASK STORE - File de travail durable et protocole de distribution
 *
 * RÔLE : Enqueue / ClaimNext / UpdateStatus / ListPending + reclaim des tâches orphelines.
 *
 * FONCTIONNEMENT :
 * - Chaque tâche vit derrière son propre verrou : le claim est une mise à jour
 *   conditionnelle (Pending -> Claimed) sur l'enregistrement, pas un verrou global
 * - Index par hôte cible limité aux tâches non terminales
 * - Unicité (expérience, hôte, variante, type) pour toute tâche non terminale
 * - Long-poll : un Notify par hôte, réveillé à l'enqueue et au reclaim
 * - Reclaim : seul déclencheur de retry, jamais l'agent lui-même
 */

use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StoreError;
use crate::models::{HostId, NewTask, Task, TaskId, TaskKey, TaskStatus};

type TaskCell = Arc<Mutex<Task>>;

#[derive(Default)]
struct TaskIndex {
    tasks: HashMap<TaskId, TaskCell>,
    /// Tâches non terminales par hôte cible
    open_by_host: HashMap<HostId, Vec<TaskId>>,
    by_experiment: HashMap<String, Vec<TaskId>>,
}

pub struct TaskStore {
    index: RwLock<TaskIndex>,
    active_keys: Mutex<HashMap<TaskKey, TaskId>>,
    seq: AtomicU64,
    waiters: Mutex<HashMap<HostId, Arc<Notify>>>,
    changes: Arc<Notify>,
    dirty: Arc<AtomicBool>,
}

impl TaskStore {
    pub fn new(dirty: Arc<AtomicBool>) -> Self {
        Self {
            index: RwLock::new(TaskIndex::default()),
            active_keys: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
            changes: Arc::new(Notify::new()),
            dirty,
        }
    }

    /// Réveillé à chaque changement de statut (boucle du controller)
    pub fn changes(&self) -> Arc<Notify> {
        self.changes.clone()
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn waiter(&self, host_id: &str) -> Arc<Notify> {
        self.waiters
            .lock()
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake_host(&self, host_id: &str) {
        if let Some(notify) = self.waiters.lock().get(host_id) {
            notify.notify_waiters();
        }
    }

    /// Insère une tâche Pending. Duplicate si une tâche non terminale existe déjà pour la même clé.
    pub fn enqueue(&self, new: NewTask, now: OffsetDateTime) -> Result<Task, StoreError> {
        let key = TaskKey {
            experiment_id: new.experiment_id.clone(),
            host_id: new.host_id.clone(),
            variant: new.variant,
            kind: new.kind,
        };

        let task = {
            let mut active = self.active_keys.lock();
            if let Some(existing) = active.get(&key) {
                return Err(StoreError::Duplicate(existing.clone()));
            }

            let task = Task {
                id: Uuid::new_v4().to_string(),
                experiment_id: new.experiment_id,
                host_id: new.host_id,
                variant: new.variant,
                kind: new.kind,
                payload: new.payload,
                priority: new.priority,
                status: TaskStatus::Pending,
                attempt: new.attempt.max(1),
                max_attempts: new.max_attempts.max(1),
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                enqueued_at: now,
                claimed_by: None,
                claimed_at: None,
                last_update: now,
                detail: None,
                permanent_failure: false,
            };
            active.insert(key, task.id.clone());

            let mut index = self.index.write();
            index
                .open_by_host
                .entry(task.host_id.clone())
                .or_default()
                .push(task.id.clone());
            index
                .by_experiment
                .entry(task.experiment_id.clone())
                .or_default()
                .push(task.id.clone());
            index.tasks.insert(task.id.clone(), Arc::new(Mutex::new(task.clone())));
            task
        };

        info!(
            "[store] enqueued {:?} task {} for host {} (experiment {}, {}, attempt {})",
            task.kind,
            task.id,
            task.host_id,
            task.experiment_id,
            task.variant.as_str(),
            task.attempt
        );
        self.mark_dirty();
        self.wake_host(&task.host_id);
        self.changes.notify_waiters();
        Ok(task)
    }

    fn open_cells(&self, host_id: &str) -> Vec<TaskCell> {
        let index = self.index.read();
        index
            .open_by_host
            .get(host_id)
            .map(|ids| ids.iter().filter_map(|id| index.tasks.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Réclame jusqu'à `max` tâches pour l'hôte. Les tâches déjà Claimed par ce même hôte
    /// (réponse perdue) sont redistribuées en premier, inchangées (`claimed_at` d'origine) :
    /// un `Some` n'est donc pas forcément une nouvelle transition Pending → Claimed.
    pub fn claim_up_to(
        &self,
        host_id: &str,
        capabilities: &[String],
        max: usize,
        now: OffsetDateTime,
    ) -> Vec<Task> {
        if max == 0 {
            return Vec::new();
        }

        // Ordonnancement : redistributions, puis (enqueued_at, priorité desc, seq)
        let mut candidates: Vec<(bool, OffsetDateTime, Reverse<i32>, u64, TaskCell)> = self
            .open_cells(host_id)
            .into_iter()
            .filter_map(|cell| {
                let (redeliver, enqueued_at, priority, seq) = {
                    let task = cell.lock();
                    let redeliver = task.status == TaskStatus::Claimed
                        && task.claimed_by.as_deref() == Some(host_id);
                    let claimable = task.status == TaskStatus::Pending
                        && capabilities.iter().any(|c| c == task.kind.required_capability());
                    if !redeliver && !claimable {
                        return None;
                    }
                    (redeliver, task.enqueued_at, task.priority, task.seq)
                };
                Some((!redeliver, enqueued_at, Reverse(priority), seq, cell))
            })
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3)));

        let mut claimed = Vec::new();
        for (_, _, _, _, cell) in candidates {
            if claimed.len() >= max {
                break;
            }
            let mut task = cell.lock();
            match task.status {
                TaskStatus::Claimed if task.claimed_by.as_deref() == Some(host_id) => {
                    debug!("[store] redelivering task {} to {}", task.id, host_id);
                    claimed.push(task.clone());
                }
                // mise à jour conditionnelle : seul le premier à voir Pending gagne
                TaskStatus::Pending => {
                    task.status = TaskStatus::Claimed;
                    task.claimed_by = Some(host_id.to_string());
                    task.claimed_at = Some(now);
                    task.last_update = now;
                    info!("[store] task {} claimed by {}", task.id, host_id);
                    claimed.push(task.clone());
                }
                _ => {}
            }
        }

        if !claimed.is_empty() {
            self.mark_dirty();
        }
        claimed
    }

    /// ClaimNext. Deux agents distincts ne peuvent jamais obtenir la même tâche : le perdant
    /// reçoit `None`. Le même hôte qui redemande reçoit à nouveau la tâche qu'il détient.
    pub fn claim_next(&self, host_id: &str, capabilities: &[String], now: OffsetDateTime) -> Option<Task> {
        self.claim_up_to(host_id, capabilities, 1, now).pop()
    }

    /// ClaimNext bloquant : attend un enqueue/reclaim pour cet hôte jusqu'à `wait`
    pub async fn claim_wait(
        &self,
        host_id: &str,
        capabilities: &[String],
        max: usize,
        wait: Duration,
    ) -> Vec<Task> {
        let deadline = tokio::time::Instant::now() + wait;
        let notify = self.waiter(host_id);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // enregistré avant la vérification : aucun réveil perdu
            notified.as_mut().enable();

            let claimed = self.claim_up_to(host_id, capabilities, max, OffsetDateTime::now_utc());
            if !claimed.is_empty() {
                return claimed;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    fn cell(&self, task_id: &str) -> Result<TaskCell, StoreError> {
        self.index
            .read()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    /// Transition de statut. `reporter` = hôte qui rapporte (None = controller).
    pub fn update_status(
        &self,
        task_id: &str,
        reporter: Option<&str>,
        to: TaskStatus,
        detail: Option<String>,
        now: OffsetDateTime,
    ) -> Result<Task, StoreError> {
        self.apply_status(task_id, reporter, to, detail, false, now)
    }

    /// Failed définitif : le controller ne re-enqueue pas
    pub fn fail_permanently(
        &self,
        task_id: &str,
        reporter: &str,
        detail: Option<String>,
        now: OffsetDateTime,
    ) -> Result<Task, StoreError> {
        self.apply_status(task_id, Some(reporter), TaskStatus::Failed, detail, true, now)
    }

    fn apply_status(
        &self,
        task_id: &str,
        reporter: Option<&str>,
        to: TaskStatus,
        detail: Option<String>,
        permanent: bool,
        now: OffsetDateTime,
    ) -> Result<Task, StoreError> {
        let cell = self.cell(task_id)?;
        let updated = {
            let mut task = cell.lock();
            let from = task.status;

            if let Some(host) = reporter {
                if task.claimed_by.as_deref() != Some(host) {
                    return Err(StoreError::NotOwner {
                        task_id: task.id.clone(),
                        owner: task.claimed_by.clone(),
                        reporter: host.to_string(),
                    });
                }
            }

            // rapport rejoué par l'agent : idempotent
            if from == to && reporter.is_some() {
                return Ok(task.clone());
            }

            let allowed = match (from, to, reporter) {
                (TaskStatus::Claimed, TaskStatus::Running, Some(_)) => true,
                (TaskStatus::Claimed | TaskStatus::Running, TaskStatus::Succeeded | TaskStatus::Failed, Some(_)) => {
                    true
                }
                (TaskStatus::Pending, TaskStatus::Cancelled, None) => true,
                _ => false,
            };
            if !allowed {
                return Err(StoreError::InvalidTransition { task_id: task.id.clone(), from, to });
            }

            task.status = to;
            task.last_update = now;
            task.permanent_failure = permanent && to == TaskStatus::Failed;
            if detail.is_some() {
                task.detail = detail;
            }
            task.clone()
        };

        if updated.status.is_terminal() {
            self.forget_open(&updated);
        }
        debug!("[store] task {} -> {:?}", updated.id, updated.status);
        self.mark_dirty();
        self.changes.notify_waiters();
        Ok(updated)
    }

    pub fn cancel(&self, task_id: &str, reason: &str, now: OffsetDateTime) -> Result<Task, StoreError> {
        let task = self.update_status(task_id, None, TaskStatus::Cancelled, Some(reason.to_string()), now)?;
        info!("[store] task {} cancelled: {}", task.id, reason);
        Ok(task)
    }

    fn forget_open(&self, task: &Task) {
        let mut active = self.active_keys.lock();
        if active.get(&task.key()).map(|id| id == &task.id).unwrap_or(false) {
            active.remove(&task.key());
        }
        let mut index = self.index.write();
        if let Some(ids) = index.open_by_host.get_mut(&task.host_id) {
            ids.retain(|id| id != &task.id);
        }
    }

    /// Remet en Pending (attempt + 1) les tâches dont le propriétaire n'a plus donné signe
    /// de vie depuis `threshold`. Budget épuisé => Failed.
    pub fn reclaim_stale<F>(&self, now: OffsetDateTime, threshold: Duration, last_heartbeat: F) -> Vec<Task>
    where
        F: Fn(&str) -> Option<OffsetDateTime>,
    {
        let threshold = time::Duration::try_from(threshold).unwrap_or(time::Duration::MAX);
        let held: Vec<TaskCell> = {
            let index = self.index.read();
            index
                .open_by_host
                .values()
                .flatten()
                .filter_map(|id| index.tasks.get(id).cloned())
                .collect()
        };

        let mut reclaimed = Vec::new();
        let mut exhausted = Vec::new();
        for cell in held {
            let mut task = cell.lock();
            if !task.status.is_held() {
                continue;
            }
            let Some(owner) = task.claimed_by.clone() else { continue };
            let last_sign = match (last_heartbeat(&owner), task.claimed_at) {
                (Some(hb), Some(claimed)) => hb.max(claimed),
                (Some(hb), None) => hb,
                (None, Some(claimed)) => claimed,
                (None, None) => task.last_update,
            };
            if now - last_sign <= threshold {
                continue;
            }

            if task.attempts_left() {
                task.status = TaskStatus::Pending;
                task.claimed_by = None;
                task.claimed_at = None;
                task.attempt += 1;
                task.last_update = now;
                task.detail = Some(format!("reclaimed: owner {owner} lost"));
                warn!("[store] reclaimed task {} from lost host {} (attempt {})", task.id, owner, task.attempt);
                reclaimed.push(task.clone());
            } else {
                task.status = TaskStatus::Failed;
                task.last_update = now;
                task.detail = Some(format!("owner {owner} lost, attempts exhausted"));
                warn!("[store] task {} failed: owner {} lost, attempts exhausted", task.id, owner);
                exhausted.push(task.clone());
            }
        }

        for task in &exhausted {
            self.forget_open(task);
        }
        if !reclaimed.is_empty() || !exhausted.is_empty() {
            self.mark_dirty();
            for task in &reclaimed {
                self.wake_host(&task.host_id);
            }
            self.changes.notify_waiters();
        }
        reclaimed.extend(exhausted);
        reclaimed
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.cell(task_id).ok().map(|cell| cell.lock().clone())
    }

    pub fn list_pending(&self, host_id: &str) -> Vec<Task> {
        let mut pending: Vec<Task> = self
            .open_cells(host_id)
            .into_iter()
            .map(|cell| cell.lock().clone())
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| (t.enqueued_at, Reverse(t.priority), t.seq));
        pending
    }

    /// Historique complet d'une expérience, ordre d'insertion
    pub fn for_experiment(&self, experiment_id: &str) -> Vec<Task> {
        let cells: Vec<TaskCell> = {
            let index = self.index.read();
            index
                .by_experiment
                .get(experiment_id)
                .map(|ids| ids.iter().filter_map(|id| index.tasks.get(id).cloned()).collect())
                .unwrap_or_default()
        };
        let mut tasks: Vec<Task> = cells.into_iter().map(|cell| cell.lock().clone()).collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn snapshot(&self) -> Vec<Task> {
        let cells: Vec<TaskCell> = self.index.read().tasks.values().cloned().collect();
        let mut tasks: Vec<Task> = cells.into_iter().map(|cell| cell.lock().clone()).collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Reconstruit index, clés actives et séquence depuis un snapshot
    pub fn restore(&self, tasks: Vec<Task>) {
        let mut active = self.active_keys.lock();
        let mut index = self.index.write();
        let mut max_seq = 0;
        for task in tasks {
            max_seq = max_seq.max(task.seq);
            if !task.status.is_terminal() {
                active.insert(task.key(), task.id.clone());
                index.open_by_host.entry(task.host_id.clone()).or_default().push(task.id.clone());
            }
            index
                .by_experiment
                .entry(task.experiment_id.clone())
                .or_default()
                .push(task.id.clone());
            index.tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        }
        self.seq.store(max_seq, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskKind, TaskPayload, Variant};

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(AtomicBool::new(false)))
    }

    fn new_task(host: &str, kind: TaskKind, variant: Variant, priority: i32) -> NewTask {
        NewTask {
            experiment_id: "exp-1".into(),
            host_id: host.into(),
            variant,
            kind,
            payload: TaskPayload::default(),
            priority,
            attempt: 1,
            max_attempts: 2,
        }
    }

    fn caps() -> Vec<String> {
        vec!["collector".into(), "loadsim".into()]
    }

    #[test]
    fn duplicate_non_terminal_task_is_rejected() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        let err = store
            .enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now)
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // autre variante : clé distincte
        store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Candidate, 0), now).unwrap();
    }

    #[test]
    fn terminal_task_frees_its_key() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        store.claim_next("h1", &caps(), now).unwrap();
        store.update_status(&task.id, Some("h1"), TaskStatus::Failed, Some("boom".into()), now).unwrap();

        let retry = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now);
        assert!(retry.is_ok());
    }

    #[test]
    fn claim_orders_by_insertion_then_priority() {
        let store = store();
        let t0 = OffsetDateTime::now_utc();
        let t1 = t0 + time::Duration::seconds(1);
        let first = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), t0).unwrap();
        let low = store.enqueue(new_task("h1", TaskKind::LoadSimStart, Variant::Baseline, 1), t1).unwrap();
        let high = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Candidate, 9), t1).unwrap();

        let claimed = store.claim_up_to("h1", &caps(), 3, t1);
        let ids: Vec<&str> = claimed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), high.id.as_str(), low.id.as_str()]);
    }

    #[test]
    fn claim_requires_matching_host_and_capability() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        store.enqueue(new_task("h1", TaskKind::LoadSimStart, Variant::Baseline, 0), now).unwrap();

        assert!(store.claim_next("h2", &caps(), now).is_none());
        assert!(store.claim_next("h1", &["collector".to_string()], now).is_none());
        assert!(store.claim_next("h1", &caps(), now).is_some());
    }

    #[test]
    fn claimed_task_is_redelivered_to_same_host_only() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        store.claim_next("h1", &caps(), now).unwrap();
        assert!(store.claim_next("h2", &caps(), now).is_none());

        let later = now + time::Duration::seconds(5);
        let again = store.claim_next("h1", &caps(), later).unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.status, TaskStatus::Claimed);
        assert_eq!(again.claimed_at, Some(now));

        store.update_status(&task.id, Some("h1"), TaskStatus::Running, None, now).unwrap();
        assert!(store.claim_next("h1", &caps(), now).is_none());
    }

    #[test]
    fn status_updates_enforce_owner_and_transitions() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();

        let err = store.update_status(&task.id, Some("h1"), TaskStatus::Running, None, now).unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));

        store.claim_next("h1", &caps(), now).unwrap();
        let err = store.update_status(&task.id, Some("h2"), TaskStatus::Succeeded, None, now).unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));

        let err = store.cancel(&task.id, "stop", now).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.update_status(&task.id, Some("h1"), TaskStatus::Running, None, now).unwrap();
        // rejoué : idempotent
        store.update_status(&task.id, Some("h1"), TaskStatus::Running, None, now).unwrap();
        let done = store.update_status(&task.id, Some("h1"), TaskStatus::Succeeded, None, now).unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);

        let err = store.update_status(&task.id, Some("h1"), TaskStatus::Failed, None, now).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn permanent_failure_is_not_retryable() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        store.claim_next("h1", &caps(), now).unwrap();
        let failed = store
            .fail_permanently(&task.id, "h1", Some("unknown placeholder ${region}".into()), now)
            .unwrap();
        assert!(failed.permanent_failure);
        assert!(!failed.is_retryable_failure());
    }

    #[test]
    fn pending_task_can_be_cancelled() {
        let store = store();
        let now = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        let cancelled = store.cancel(&task.id, "experiment stopped", now).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(store.list_pending("h1").is_empty());
        assert_eq!(store.for_experiment("exp-1").len(), 1);
    }

    #[test]
    fn stale_claim_is_reclaimed_exactly_once() {
        let store = store();
        let t0 = OffsetDateTime::now_utc();
        let task = store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), t0).unwrap();
        store.claim_next("h1", &caps(), t0).unwrap();

        let later = t0 + time::Duration::seconds(120);
        let no_heartbeat = |_: &str| None;

        let reclaimed = store.reclaim_stale(later, Duration::from_secs(60), no_heartbeat);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, TaskStatus::Pending);
        assert_eq!(reclaimed[0].attempt, task.attempt + 1);
        assert!(reclaimed[0].claimed_by.is_none());

        let again = store.reclaim_stale(later + time::Duration::seconds(60), Duration::from_secs(60), no_heartbeat);
        assert!(again.is_empty());
        assert_eq!(store.get(&task.id).unwrap().attempt, task.attempt + 1);
    }

    #[test]
    fn recent_heartbeat_prevents_reclaim() {
        let store = store();
        let t0 = OffsetDateTime::now_utc();
        store.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), t0).unwrap();
        store.claim_next("h1", &caps(), t0).unwrap();

        let later = t0 + time::Duration::seconds(120);
        let alive = |_: &str| Some(later - time::Duration::seconds(5));
        assert!(store.reclaim_stale(later, Duration::from_secs(60), alive).is_empty());
    }

    #[test]
    fn reclaim_with_exhausted_budget_fails_the_task() {
        let store = store();
        let t0 = OffsetDateTime::now_utc();
        let mut draft = new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0);
        draft.attempt = 2;
        let task = store.enqueue(draft, t0).unwrap();
        store.claim_next("h1", &caps(), t0).unwrap();

        let reclaimed = store.reclaim_stale(t0 + time::Duration::seconds(300), Duration::from_secs(60), |_| None);
        assert_eq!(reclaimed[0].status, TaskStatus::Failed);
        assert_eq!(store.get(&task.id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn claim_wait_wakes_on_enqueue() {
        let store = Arc::new(store());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_wait("h1", &caps(), 4, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), OffsetDateTime::now_utc())
            .unwrap();

        let claimed = waiter.await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn claim_wait_times_out_empty() {
        let store = store();
        let claimed = store.claim_wait("h1", &caps(), 1, Duration::from_millis(50)).await;
        assert!(claimed.is_empty());
    }

    #[test]
    fn restore_rebuilds_keys_and_sequence() {
        let source = store();
        let now = OffsetDateTime::now_utc();
        source.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        let done = source.enqueue(new_task("h2", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        source.claim_next("h2", &caps(), now).unwrap();
        source.update_status(&done.id, Some("h2"), TaskStatus::Succeeded, None, now).unwrap();

        let restored = store();
        restored.restore(source.snapshot());
        assert!(matches!(
            restored.enqueue(new_task("h1", TaskKind::CollectorStart, Variant::Baseline, 0), now),
            Err(StoreError::Duplicate(_))
        ));
        let next = restored.enqueue(new_task("h3", TaskKind::CollectorStart, Variant::Baseline, 0), now).unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(restored.list_pending("h1").len(), 1);
    }
}
