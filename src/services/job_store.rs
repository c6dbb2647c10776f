//! In-memory job store
//!
//! Owns every Job created by admission. A single mutex covers the job list;
//! it is held for bookkeeping only, never across PLC I/O.

use crate::domain::job::Job;
use crate::domain::types::{DetectionRoom, JobId, RoomId, Rule};
use crate::services::admission::{occupancy, try_admit, AdmissionRejection};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// What a scan at a room means for the box's job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanDecision {
    /// No job was ever declared for this box
    NoJob,
    /// Job already finished; re-entry needs a new declaration
    AlreadyComplete(JobId),
    /// Box showed up at a room it was not assigned to
    WrongRoom { job_id: JobId, assigned: RoomId },
    /// Box arrived at its room: detection begins
    FirstScan(JobId),
    /// Box is leaving its room: detection done
    SecondScan(JobId),
    /// Further scans change nothing
    Duplicate(JobId),
}

/// Optional declaration details carried onto the job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declaration {
    pub work_order: Option<String>,
    pub inspector_id: Option<String>,
}

pub struct JobStore {
    jobs: Mutex<Vec<Job>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl JobStore {
    /// `capacity` is the number of undetected boxes a room may hold
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a box and create its job.
    ///
    /// The room is chosen on a snapshot of the job list, then capacity and
    /// the active-job check are repeated under the lock right before the job
    /// is committed, so two concurrent declarations can never overfill a room.
    pub fn admit(
        &self,
        box_code: &str,
        rules: &[Rule],
        rooms: &[DetectionRoom],
        declaration: Declaration,
    ) -> Result<Job, AdmissionRejection> {
        let snapshot = self.jobs.lock().clone();
        let assigned = try_admit(box_code, rules, rooms, &snapshot, self.capacity)?;

        let mut jobs = self.jobs.lock();
        if let Some(active) = jobs.iter().filter(|j| j.box_code == box_code && !j.is_complete()).max_by_key(|j| j.id) {
            return Err(AdmissionRejection::AlreadyActive {
                box_code: box_code.to_string(),
                job_id: active.id,
            });
        }
        if occupancy(assigned.room_id, &jobs) >= self.capacity {
            debug!(box_code = %box_code, room = %assigned.room_name, "admission_recheck_failed");
            return Err(AdmissionRejection::AllRoomsFull { rooms: vec![assigned.room_name] });
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(id, box_code, assigned.room_id, &assigned.room_name, assigned.rule_id)
            .with_work_order(declaration.work_order)
            .with_inspector(declaration.inspector_id);
        jobs.push(job.clone());

        info!(
            job_id = %id,
            box_code = %box_code,
            room_id = %assigned.room_id,
            room = %assigned.room_name,
            rule_id = %assigned.rule_id,
            "job_admitted"
        );
        Ok(job)
    }

    /// Most recently created job for a box code
    pub fn latest_for_code(&self, box_code: &str) -> Option<Job> {
        latest(&self.jobs.lock(), box_code).cloned()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().iter().find(|j| j.id == id).cloned()
    }

    /// Apply a scan of `box_code` at `room_id` to the box's latest job
    pub fn record_scan(&self, box_code: &str, room_id: RoomId) -> ScanDecision {
        let mut jobs = self.jobs.lock();
        let Some(index) = latest_index(&jobs, box_code) else {
            return ScanDecision::NoJob;
        };
        let job = &mut jobs[index];

        if job.is_complete() {
            return ScanDecision::AlreadyComplete(job.id);
        }
        if job.room_id != room_id {
            return ScanDecision::WrongRoom { job_id: job.id, assigned: job.room_id };
        }

        job.scan_count = job.scan_count.saturating_add(1);
        match job.scan_count {
            1 => {
                job.begin_detection();
                info!(job_id = %job.id, box_code = %box_code, room_id = %room_id, "job_detecting");
                ScanDecision::FirstScan(job.id)
            }
            2 => {
                job.complete();
                info!(job_id = %job.id, box_code = %box_code, room_id = %room_id, "job_complete");
                ScanDecision::SecondScan(job.id)
            }
            _ => ScanDecision::Duplicate(job.id),
        }
    }

    /// Jobs not yet complete
    pub fn outstanding(&self) -> usize {
        self.jobs.lock().iter().filter(|j| !j.is_complete()).count()
    }

    /// Undetected jobs per room
    pub fn queued_by_room(&self) -> FxHashMap<RoomId, usize> {
        let mut counts = FxHashMap::default();
        for job in self.jobs.lock().iter().filter(|j| !j.is_complete() && j.scan_count == 0) {
            *counts.entry(job.room_id).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

fn latest_index(jobs: &[Job], box_code: &str) -> Option<usize> {
    jobs.iter()
        .enumerate()
        .filter(|(_, j)| j.box_code == box_code)
        .max_by_key(|(_, j)| j.id)
        .map(|(i, _)| i)
}

fn latest<'a>(jobs: &'a [Job], box_code: &str) -> Option<&'a Job> {
    latest_index(jobs, box_code).map(|i| &jobs[i])
}
