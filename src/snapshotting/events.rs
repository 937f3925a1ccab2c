use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Client, Resource, ResourceExt as _,
};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument as _};

use super::{
    manager::log_cleanup, Manager, RESOURCE_TYPE_LABEL, SNAPSHOT_MANAGER_LABEL,
    SNAPSHOT_MANAGER_VALUE,
};
use crate::{
    crd::{SnapshottingPhase, SnapshottingStatus, VolumeSnapshot},
    AppError, Result,
};

/// Delay before a Job or VolumeSnapshot event that failed to apply is handled again.
pub const EVENT_RETRY: Duration = Duration::from_secs(5);

/// Whether a Job that started at `status.startTime` has been running for longer than `timeout`
/// at `now`. Jobs that haven't started never time out.
pub fn is_job_timed_out(job: &Job, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(start) = job.status.as_ref().and_then(|x| x.start_time.as_ref()) else {
        return false;
    };
    let timeout = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    (now - start.0).num_seconds() > timeout
}

/// When to look at a running Job again so its timeout is noticed without a new event.
pub fn job_timeout_check(job: &Job, now: DateTime<Utc>, timeout: Duration) -> Option<Duration> {
    let start = job.status.as_ref()?.start_time.as_ref()?;
    let elapsed = (now - start.0).to_std().unwrap_or_default();
    Some(timeout.saturating_sub(elapsed) + Duration::from_secs(1))
}

impl Manager {
    /// Apply a Job change to the owner's status. Only Jobs created by this manager count, and
    /// only while the owner is waiting on its download.
    pub async fn on_job_change(&self, job: &Job) -> Result<Action> {
        self.on_job_change_at(job, Utc::now()).await
    }

    /// [`Manager::on_job_change`] with the Job's age measured at `now`.
    #[instrument(skip_all, fields(name = %job.name_any()))]
    pub async fn on_job_change_at(&self, job: &Job, now: DateTime<Utc>) -> Result<Action> {
        let Some(ns) = job.namespace() else { return Ok(Action::await_change()) };
        if job.meta().deletion_timestamp.is_some() || !self.is_managed(job) {
            return Ok(Action::await_change());
        }
        let name = job.name_any();

        let (succeeded, failed) = job
            .status
            .as_ref()
            .map(|x| (x.succeeded.unwrap_or(0), x.failed.unwrap_or(0)))
            .unwrap_or_default();
        let timeout = self.config.job_timeout();
        let timed_out = is_job_timed_out(job, now, timeout);
        if succeeded == 0 && failed == 0 && !timed_out {
            return Ok(job_timeout_check(job, now, timeout)
                .map_or_else(Action::await_change, Action::requeue));
        }

        let Some(status) = self.owner_status(&ns, &name).await? else {
            return Ok(Action::await_change());
        };
        if (failed > 0 || (succeeded == 0 && timed_out)) && !status.is_empty() {
            // Kept for inspection even after the owner moved on, cancelled runs excepted
            self.keep_failed_job(job).await;
        }

        let phase = status.current_phase();
        if !matches!(phase, SnapshottingPhase::PvcReady | SnapshottingPhase::Downloading) {
            debug!(ns, name, %phase, "Ignoring Job event outside the download phase");
            return Ok(Action::await_change());
        }

        let status = if succeeded > 0 {
            info!(ns, name, "Job succeeded");
            SnapshottingStatus::new(SnapshottingPhase::Downloaded, "Job completed successfully")
        } else {
            let message = if failed > 0 {
                format!("Job {name} failed")
            } else {
                format!("Job {name} timed out after {}s", self.config.job_timeout_secs)
            };
            error!(ns, name, %message, "Download failed");
            SnapshottingStatus::new(SnapshottingPhase::Failed, message)
        };

        self.update_status(&ns, &name, &status.with_pvc(&name).with_job(&name)).await?;
        Ok(Action::await_change())
    }

    /// Apply a VolumeSnapshot change to the owner's status. Only snapshots created by this
    /// manager count, and only while the owner is waiting on its snapshot.
    pub async fn on_volume_snapshot_change(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        let Some(ns) = snapshot.namespace() else { return Ok(()) };
        if snapshot.meta().deletion_timestamp.is_some() || !self.is_managed(snapshot) {
            return Ok(());
        }
        let name = snapshot.name_any();

        let status = if let Some(err) = snapshot.error() {
            let message = err.message.as_deref().unwrap_or_default();
            error!(ns, name, message, "VolumeSnapshot failed");
            SnapshottingStatus::new(
                SnapshottingPhase::Failed,
                format!("VolumeSnapshot failed: {message}"),
            )
        } else if snapshot.ready_to_use() {
            SnapshottingStatus::new(SnapshottingPhase::SnapshotReady, "VolumeSnapshot is ready")
        } else {
            return Ok(());
        };

        let Some(current) = self.owner_status(&ns, &name).await? else { return Ok(()) };
        let phase = current.current_phase();
        if !matches!(phase, SnapshottingPhase::Downloaded | SnapshottingPhase::Snapshotting) {
            debug!(ns, name, %phase, "Ignoring VolumeSnapshot event outside the snapshot phase");
            return Ok(());
        }

        let ready = status.phase == Some(SnapshottingPhase::SnapshotReady);
        let status = status.with_pvc(&name).with_job(&name).with_snapshot(&name);
        self.update_status(&ns, &name, &status).await?;

        if ready {
            info!(ns, name, "VolumeSnapshot is ready");
            // The snapshot holds the data now
            let res = self.ops.delete_pvc(&ns, &name).await;
            log_cleanup("PersistentVolumeClaim", &name, res);
        }
        Ok(())
    }

    /// Status of the resource owning `name`, `None` once the owner is gone.
    async fn owner_status(&self, ns: &str, name: &str) -> Result<Option<SnapshottingStatus>> {
        match self.handler.get_snapshotting_status(ns, name).await {
            Ok(status) => Ok(Some(status)),
            Err(err) if err.is_not_found() => {
                debug!(ns, name, "Owner is gone");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn is_managed<K: Resource>(&self, obj: &K) -> bool {
        let labels = obj.labels();
        labels.get(SNAPSHOT_MANAGER_LABEL).map(String::as_str) == Some(SNAPSHOT_MANAGER_VALUE)
            && labels.get(RESOURCE_TYPE_LABEL).map(String::as_str)
                == Some(self.handler.resource_type())
    }

    /// Best effort, failures are logged.
    async fn keep_failed_job(&self, job: &Job) {
        let ttl = self.config.failed_job_ttl_secs;
        if job.spec.as_ref().and_then(|x| x.ttl_seconds_after_finished) == Some(ttl) {
            return;
        }

        let mut job = job.clone();
        if let Some(spec) = job.spec.as_mut() {
            spec.ttl_seconds_after_finished = Some(ttl);
        }
        let name = job.name_any();
        match self.ops.update_job(&job).await {
            Ok(()) => info!(name, ttl, "Set TTL for failed job"),
            Err(err) => warn!(name, error = %err, "Failed to set TTL for failed job"),
        }
    }

    fn watch_selector(&self) -> watcher::Config {
        watcher::Config::default().labels(&format!(
            "{SNAPSHOT_MANAGER_LABEL}={SNAPSHOT_MANAGER_VALUE},{RESOURCE_TYPE_LABEL}={}",
            self.handler.resource_type()
        ))
    }

    /// Run the `<type>-snapshotting-job` and `<type>-snapshotting-snapshot` controllers in the
    /// background.
    pub(super) fn spawn_controllers(&self, client: Client) {
        let kind = self.handler.resource_type().to_string();
        let manager = Arc::new(self.clone());

        let jobs = Controller::new(Api::<Job>::all(client.clone()), self.watch_selector())
            .shutdown_on_signal()
            .run(reconcile_job, error_policy::<Job>, manager.clone())
            .for_each(log_result);
        let span = info_span!("controller", name = %format!("{kind}-snapshotting-job"));
        tokio::spawn(jobs.instrument(span));

        let snapshots =
            Controller::new(Api::<VolumeSnapshot>::all(client), self.watch_selector())
                .shutdown_on_signal()
                .run(reconcile_volume_snapshot, error_policy::<VolumeSnapshot>, manager)
                .for_each(log_result);
        let span = info_span!("controller", name = %format!("{kind}-snapshotting-snapshot"));
        tokio::spawn(snapshots.instrument(span));
    }
}

async fn reconcile_job(job: Arc<Job>, manager: Arc<Manager>) -> Result<Action> {
    manager.on_job_change(&job).await
}

async fn reconcile_volume_snapshot(
    snapshot: Arc<VolumeSnapshot>, manager: Arc<Manager>,
) -> Result<Action> {
    manager.on_volume_snapshot_change(&snapshot).await?;
    Ok(Action::await_change())
}

/// Hand a Job or VolumeSnapshot whose change couldn't be applied back to its controller. The
/// object is re-read from the cache, so a finished Job or ready snapshot that never changes
/// again is still picked up.
pub fn error_policy<K: Resource>(obj: Arc<K>, err: &AppError, _manager: Arc<Manager>) -> Action {
    warn!(name = %obj.name_any(), error = %err, "Failed to apply change, retrying");
    Action::requeue(EVENT_RETRY)
}

async fn log_result<T: std::fmt::Debug, E: std::fmt::Display>(res: Result<T, E>) {
    match res {
        Ok(obj) => debug!(?obj, "Reconciled"),
        Err(err) => warn!(error = %err, "Reconcile failed"),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::batch::v1::JobStatus, apimachinery::pkg::apis::meta::v1::Time,
    };

    use super::*;

    fn started(secs_ago: i64, now: DateTime<Utc>) -> Job {
        Job {
            status: Some(JobStatus {
                start_time: Some(Time(now - chrono::Duration::seconds(secs_ago))),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn job_times_out_after_the_limit() {
        let now = Utc::now();
        let limit = Duration::from_secs(3600);
        assert!(!is_job_timed_out(&started(3600, now), now, limit));
        assert!(is_job_timed_out(&started(3601, now), now, limit));
        assert!(is_job_timed_out(&started(7200, now), now, limit));
        assert!(!is_job_timed_out(&started(60, now), now, limit));
        assert!(!is_job_timed_out(&Job::default(), now, limit));
    }

    #[test]
    fn running_job_is_checked_again_just_past_the_limit() {
        let now = Utc::now();
        let limit = Duration::from_secs(3600);
        let job = started(600, now);
        assert_eq!(job_timeout_check(&job, now, limit), Some(Duration::from_secs(3001)));

        let later = now + chrono::Duration::seconds(3001);
        assert!(is_job_timed_out(&job, later, limit));
        // Overdue Jobs are looked at right away
        let overdue = started(7200, now);
        assert_eq!(job_timeout_check(&overdue, now, limit), Some(Duration::from_secs(1)));
        assert_eq!(job_timeout_check(&Job::default(), now, limit), None);
    }
}
