//! Tracked execution of long-running work.
//!
//! `submit` records a `pending` row and hands the work to a
//! [`TaskExecutor`]. The worker moves the row to `running`, runs the work
//! and stores either its JSON result (`success`) or `{"error": message}`
//! (`failed`). Errors and panics never leave the worker.

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info_span;
use uuid::Uuid;

use super::{JobInfo, JobStatus, JobType, TaskExecutor};
use crate::db::job_repo;
use crate::db::user_repo::OwnerId;
use crate::db::Database;
use crate::error::{EsvSyncError, Result};

#[derive(Clone)]
pub struct JobRunner {
    db: Database,
    executor: Arc<dyn TaskExecutor>,
}

impl JobRunner {
    pub fn new(db: Database, executor: Arc<dyn TaskExecutor>) -> Self {
        Self { db, executor }
    }

    /// Records a pending job for `owner` and schedules `work`. Returns the
    /// job id without waiting for the work to start.
    pub fn submit<F, E>(&self, job_type: JobType, owner: OwnerId, work: F) -> Result<String>
    where
        F: FnOnce() -> std::result::Result<Value, E> + Send + 'static,
        E: Display,
    {
        let job_id = Uuid::new_v4().to_string();
        job_repo::insert_pending(&self.db, &job_id, owner, job_type.as_str())?;
        log::info!("Job {} ({}) queued for owner {}", job_id, job_type, owner);

        let db = self.db.clone();
        let task_job_id = job_id.clone();
        let scheduled = self
            .executor
            .execute(Box::new(move || run_job(&db, &task_job_id, job_type, work)));

        if let Err(e) = scheduled {
            log::error!("Job {} could not be scheduled: {}", job_id, e);
            // Walk the row through the normal transitions so it still ends
            // in a terminal state.
            job_repo::mark_running(&self.db, &job_id)?;
            job_repo::mark_finished(&self.db, &job_id, false, &error_payload(&e))?;
        }

        Ok(job_id)
    }

    pub fn get_job(&self, owner: OwnerId, job_id: &str) -> Result<JobInfo> {
        job_repo::find(&self.db, owner, job_id)?
            .ok_or_else(|| EsvSyncError::not_found("job", job_id))?
            .try_into()
    }

    pub fn get_status(&self, owner: OwnerId, job_id: &str) -> Result<JobStatus> {
        Ok(self.get_job(owner, job_id)?.status)
    }

    /// The stored result. `None` until the job reaches a terminal state.
    pub fn get_result(&self, owner: OwnerId, job_id: &str) -> Result<Option<Value>> {
        Ok(self.get_job(owner, job_id)?.result)
    }

    /// All of `owner`'s jobs, newest first.
    pub fn list_jobs(&self, owner: OwnerId) -> Result<Vec<JobInfo>> {
        job_repo::list(&self.db, owner)?
            .into_iter()
            .map(JobInfo::try_from)
            .collect()
    }
}

fn error_payload(message: &dyn Display) -> String {
    json!({ "error": message.to_string() }).to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

fn run_job<F, E>(db: &Database, job_id: &str, job_type: JobType, work: F)
where
    F: FnOnce() -> std::result::Result<Value, E>,
    E: Display,
{
    let span = info_span!("job", job_id = job_id, job_type = %job_type);
    let _enter = span.enter();

    match job_repo::mark_running(db, job_id) {
        Ok(true) => {}
        Ok(false) => {
            log::warn!("Job {} is no longer pending, skipping", job_id);
            return;
        }
        Err(e) => {
            log::error!("Job {} could not be marked running: {}", job_id, e);
            return;
        }
    }

    let (succeeded, result) = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => (true, value.to_string()),
        Ok(Err(e)) => {
            log::error!("Job {} failed: {}", job_id, e);
            (false, error_payload(&e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Job {} panicked: {}", job_id, message);
            (false, error_payload(&message))
        }
    };

    match job_repo::mark_finished(db, job_id, succeeded, &result) {
        Ok(true) => log::info!(
            "Job {} finished: {}",
            job_id,
            if succeeded { "success" } else { "failed" }
        ),
        Ok(false) => log::warn!("Job {} was not running when it finished", job_id),
        Err(e) => log::error!("Job {} result could not be stored: {}", job_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::user_repo::{ensure_provisioned, DEFAULT_ISSUER};
    use crate::jobs::{PoolError, Task, WorkerPool};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Holds tasks until the test runs them, so intermediate states can be
    /// observed.
    #[derive(Default)]
    struct ManualExecutor {
        queued: Mutex<Vec<Task>>,
    }

    impl ManualExecutor {
        fn run_all(&self) {
            let tasks: Vec<Task> = self.queued.lock().unwrap().drain(..).collect();
            for task in tasks {
                task();
            }
        }
    }

    impl TaskExecutor for ManualExecutor {
        fn execute(&self, task: Task) -> std::result::Result<(), PoolError> {
            self.queued.lock().unwrap().push(task);
            Ok(())
        }
    }

    struct RejectingExecutor;

    impl TaskExecutor for RejectingExecutor {
        fn execute(&self, _task: Task) -> std::result::Result<(), PoolError> {
            Err(PoolError::ShutDown)
        }
    }

    fn setup(executor: Arc<dyn TaskExecutor>) -> (JobRunner, OwnerId) {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let owner = ensure_provisioned(&db, "owner", DEFAULT_ISSUER).unwrap().id;
        (JobRunner::new(db, executor), owner)
    }

    fn wait_terminal(runner: &JobRunner, owner: OwnerId, job_id: &str) -> JobStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = runner.get_status(owner, job_id).unwrap();
            if status.is_terminal() || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_failed_job_records_error_message() {
        let executor = Arc::new(ManualExecutor::default());
        let (runner, owner) = setup(executor.clone());

        let job_id = runner
            .submit(JobType::ApplyPush, owner, || -> std::result::Result<Value, String> {
                Err("boom".to_string())
            })
            .unwrap();
        assert_eq!(runner.get_status(owner, &job_id).unwrap(), JobStatus::Pending);
        assert_eq!(runner.get_result(owner, &job_id).unwrap(), None);

        executor.run_all();

        assert_eq!(runner.get_status(owner, &job_id).unwrap(), JobStatus::Failed);
        assert_eq!(
            runner.get_result(owner, &job_id).unwrap(),
            Some(json!({"error": "boom"}))
        );
    }

    #[test]
    fn test_job_is_running_while_work_executes() {
        let executor = Arc::new(ManualExecutor::default());
        let (runner, owner) = setup(executor.clone());
        let observed = Arc::new(Mutex::new(None));

        let probe_runner = runner.clone();
        let probe = Arc::clone(&observed);
        let job_id_slot = Arc::new(Mutex::new(String::new()));
        let slot = Arc::clone(&job_id_slot);
        let job_id = runner
            .submit(JobType::ApplyPull, owner, move || -> Result<Value> {
                let id = slot.lock().unwrap().clone();
                *probe.lock().unwrap() = Some(probe_runner.get_status(owner, &id)?);
                Ok(json!({"ok": true}))
            })
            .unwrap();
        *job_id_slot.lock().unwrap() = job_id.clone();

        executor.run_all();

        assert_eq!(*observed.lock().unwrap(), Some(JobStatus::Running));
        assert_eq!(runner.get_status(owner, &job_id).unwrap(), JobStatus::Success);
        assert_eq!(
            runner.get_result(owner, &job_id).unwrap(),
            Some(json!({"ok": true}))
        );
    }

    #[test]
    fn test_panic_becomes_failed_job() {
        let executor = Arc::new(ManualExecutor::default());
        let (runner, owner) = setup(executor.clone());

        let job_id = runner
            .submit(JobType::Publish, owner, || -> Result<Value> {
                panic!("exploded")
            })
            .unwrap();
        executor.run_all();

        assert_eq!(runner.get_status(owner, &job_id).unwrap(), JobStatus::Failed);
        assert_eq!(
            runner.get_result(owner, &job_id).unwrap(),
            Some(json!({"error": "exploded"}))
        );
    }

    #[test]
    fn test_other_owner_gets_not_found() {
        let executor = Arc::new(ManualExecutor::default());
        let (runner, owner) = setup(executor.clone());
        let other = ensure_provisioned(&runner.db, "other", DEFAULT_ISSUER)
            .unwrap()
            .id;

        let job_id = runner
            .submit(JobType::ApplyPull, owner, || -> Result<Value> { Ok(json!({})) })
            .unwrap();

        for err in [
            runner.get_status(other, &job_id).unwrap_err(),
            runner.get_result(other, &job_id).map(|_| ()).unwrap_err(),
            runner.get_status(owner, "no-such-job").unwrap_err(),
        ] {
            assert!(matches!(err, EsvSyncError::NotFound { kind: "job", .. }));
        }
        assert!(runner.list_jobs(other).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_submissions_get_distinct_ids() {
        let pool: Arc<dyn TaskExecutor> = Arc::new(WorkerPool::new(4));
        let (runner, owner) = setup(pool);

        let ids: Vec<String> = (0..10)
            .map(|i| {
                runner
                    .submit(JobType::ApplyPull, owner, move || -> Result<Value> {
                        Ok(json!({ "n": i }))
                    })
                    .unwrap()
            })
            .collect();

        let unique: std::collections::BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        for id in &ids {
            assert_eq!(wait_terminal(&runner, owner, id), JobStatus::Success);
        }
        assert_eq!(runner.list_jobs(owner).unwrap().len(), 10);
    }

    #[test]
    fn test_jobs_queued_before_shutdown_still_finish() {
        let pool = Arc::new(WorkerPool::new(1));
        let (runner, owner) = setup(Arc::clone(&pool) as Arc<dyn TaskExecutor>);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let busy = runner
            .submit(JobType::ApplyPull, owner, move || -> Result<Value> {
                release_rx.recv().ok();
                Ok(json!({}))
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.get_status(owner, &busy).unwrap() != JobStatus::Running
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        let queued = runner
            .submit(JobType::ApplyPush, owner, || -> Result<Value> {
                Ok(json!({"queued": true}))
            })
            .unwrap();

        pool.shutdown();
        release_tx.send(()).unwrap();

        assert_eq!(wait_terminal(&runner, owner, &busy), JobStatus::Success);
        assert_eq!(wait_terminal(&runner, owner, &queued), JobStatus::Success);
        assert_eq!(
            runner.get_result(owner, &queued).unwrap(),
            Some(json!({"queued": true}))
        );
    }

    #[test]
    fn test_unschedulable_job_ends_failed() {
        let (runner, owner) = setup(Arc::new(RejectingExecutor));
        let job_id = runner
            .submit(JobType::ApplyPull, owner, || -> Result<Value> { Ok(json!({})) })
            .unwrap();

        assert_eq!(runner.get_status(owner, &job_id).unwrap(), JobStatus::Failed);
        assert_eq!(
            runner.get_result(owner, &job_id).unwrap(),
            Some(json!({"error": "Worker pool is shut down"}))
        );
    }
}
