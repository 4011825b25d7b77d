use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};

use crate::error::{BrineError, Result};
use crate::master::job::{valid_jid, Job, JobReturn};

/// Why the cache has nothing for a job id. Not an error: callers decide
/// whether "never tracked" and "gone" mean different things to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMiss {
    /// Job caching is turned off, nothing is ever tracked.
    Disabled,
    /// The job existed but aged out of the retention window.
    Evicted,
    Unknown,
}

impl std::fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMiss::Disabled => write!(f, "job cache disabled"),
            CacheMiss::Evicted => write!(f, "evicted"),
            CacheMiss::Unknown => write!(f, "unknown job id"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    Recorded,
    NotTracked(CacheMiss),
}

/// Persistence collaborator for job records.
pub trait JobStore: Send + Sync {
    fn get(&self, jid: &str) -> std::io::Result<Option<Job>>;
    fn put(&mut self, job: &Job) -> std::io::Result<()>;
    fn delete(&mut self, jid: &str) -> std::io::Result<()>;
    fn iter(&self) -> std::io::Result<Vec<Job>>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: HashMap<String, Job>,
}

impl JobStore for MemoryJobStore {
    fn get(&self, jid: &str) -> std::io::Result<Option<Job>> {
        Ok(self.jobs.get(jid).cloned())
    }

    fn put(&mut self, job: &Job) -> std::io::Result<()> {
        self.jobs.insert(job.jid.clone(), job.clone());
        Ok(())
    }

    fn delete(&mut self, jid: &str) -> std::io::Result<()> {
        self.jobs.remove(jid);
        Ok(())
    }

    fn iter(&self) -> std::io::Result<Vec<Job>> {
        Ok(self.jobs.values().cloned().collect())
    }
}

/// One JSON document per job under `<cachedir>/jobs/<jid>.json`.
#[derive(Debug, Clone)]
pub struct FsJobStore {
    dir: PathBuf,
}

impl FsJobStore {
    pub fn new(cachedir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = cachedir.into().join("jobs");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, jid: &str) -> std::io::Result<PathBuf> {
        if !valid_jid(jid) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("malformed job id {:?}", jid),
            ));
        }
        Ok(self.dir.join(format!("{}.json", jid)))
    }
}

impl JobStore for FsJobStore {
    fn get(&self, jid: &str) -> std::io::Result<Option<Job>> {
        let Ok(path) = self.path(jid) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn put(&mut self, job: &Job) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(job)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let path = self.path(&job.jid)?;
        // Write then rename so a crash never leaves a truncated record.
        let tmp = self.dir.join(format!(".{}.tmp", job.jid));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, path)
    }

    fn delete(&mut self, jid: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path(jid)?) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn iter(&self) -> std::io::Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map(|b| serde_json::from_slice::<Job>(&b)) {
                Ok(Ok(job)) => jobs.push(job),
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }
}

/// Dispatched jobs and their returns, kept for `keep_jobs` hours.
///
/// Evicted job ids are remembered for one more retention window so a late
/// return can be reported as [`CacheMiss::Evicted`] rather than
/// [`CacheMiss::Unknown`].
pub struct JobCache {
    enabled: bool,
    keep_jobs: Duration,
    store: Box<dyn JobStore>,
    evicted: HashMap<String, DateTime<Utc>>,
}

impl std::fmt::Debug for JobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCache")
            .field("enabled", &self.enabled)
            .field("keep_jobs", &self.keep_jobs)
            .field("evicted", &self.evicted.len())
            .finish()
    }
}

impl Default for JobCache {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl JobCache {
    /// In-memory cache with the given retention. A zero retention keeps jobs
    /// forever.
    pub fn new(keep_jobs: Duration) -> Self {
        Self::with_store(keep_jobs, Box::new(MemoryJobStore::default()))
    }

    pub fn with_store(keep_jobs: Duration, store: Box<dyn JobStore>) -> Self {
        Self {
            enabled: true,
            keep_jobs,
            store,
            evicted: HashMap::new(),
        }
    }

    /// A cache that tracks nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a newly dispatched job. Re-putting the same jid with the same
    /// target set is accepted and leaves collected returns alone.
    pub fn put_job(&mut self, job: Job) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if job.targets.is_empty() {
            return Err(BrineError::NoTargets(job.target.clone()));
        }
        if let Some(existing) = self.store.get(&job.jid)? {
            if existing.targets != job.targets {
                tracing::error!(
                    jid = %job.jid,
                    existing = existing.targets.len(),
                    offered = job.targets.len(),
                    "Job id collision with a different target set, rejecting publish"
                );
                return Err(BrineError::DuplicateJobId(job.jid));
            }
            tracing::debug!(jid = %job.jid, "Job already cached with identical targets");
            return Ok(());
        }
        self.evicted.remove(&job.jid);
        tracing::debug!(jid = %job.jid, function = %job.function, targets = job.targets.len(), "Job cached");
        self.store.put(&job)?;
        Ok(())
    }

    pub fn record_return(&mut self, ret: JobReturn) -> Result<ReturnOutcome> {
        self.record_return_at(ret, Utc::now())
    }

    /// Upsert a minion's return. Returns for jobs that are unknown, evicted,
    /// or past their retention window at `now` are dropped.
    pub fn record_return_at(&mut self, ret: JobReturn, now: DateTime<Utc>) -> Result<ReturnOutcome> {
        if !self.enabled {
            return Ok(ReturnOutcome::NotTracked(CacheMiss::Disabled));
        }

        let mut job = match self.store.get(&ret.jid)? {
            Some(job) => job,
            None => {
                let miss = self.miss_for(&ret.jid);
                tracing::warn!(jid = %ret.jid, minion_id = %ret.minion_id, reason = %miss, "Dropping return for untracked job");
                return Ok(ReturnOutcome::NotTracked(miss));
            }
        };

        if job.is_expired(self.keep_jobs, now) {
            self.evict(&job.jid, now)?;
            tracing::warn!(jid = %ret.jid, minion_id = %ret.minion_id, "Dropping late return for expired job");
            return Ok(ReturnOutcome::NotTracked(CacheMiss::Evicted));
        }

        if !job.targets.contains(&ret.minion_id) {
            tracing::debug!(jid = %ret.jid, minion_id = %ret.minion_id, "Return from a minion outside the target set");
        }
        tracing::debug!(jid = %ret.jid, minion_id = %ret.minion_id, success = ret.success, "Return recorded");
        job.returns.insert(ret.minion_id.clone(), ret);
        self.store.put(&job)?;
        Ok(ReturnOutcome::Recorded)
    }

    pub fn lookup(&self, jid: &str) -> std::result::Result<Job, CacheMiss> {
        if !self.enabled {
            return Err(CacheMiss::Disabled);
        }
        match self.store.get(jid) {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(self.miss_for(jid)),
            Err(e) => {
                tracing::error!(jid, error = %e, "Job store read failed");
                Err(CacheMiss::Unknown)
            }
        }
    }

    /// Remove jobs dispatched more than `keep_jobs` before `now`. Returns the
    /// number of jobs removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Result<usize> {
        if !self.enabled {
            return Ok(0);
        }
        let expired: Vec<String> = self
            .store
            .iter()?
            .into_iter()
            .filter(|j| j.is_expired(self.keep_jobs, now))
            .map(|j| j.jid)
            .collect();
        for jid in &expired {
            self.evict(jid, now)?;
        }

        let keep = self.keep_jobs;
        self.evicted.retain(|_, at| now - *at <= keep);

        if !expired.is_empty() {
            tracing::info!(evicted = expired.len(), "Expired jobs removed from cache");
        }
        Ok(expired.len())
    }

    /// All cached jobs, oldest first.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut jobs = self.store.iter()?;
        jobs.sort_by(|a, b| a.dispatched_at.cmp(&b.dispatched_at).then(a.jid.cmp(&b.jid)));
        Ok(jobs)
    }

    /// Minions targeted by `jid` that have not returned yet.
    pub fn missing(&self, jid: &str) -> std::result::Result<BTreeSet<String>, CacheMiss> {
        self.lookup(jid).map(|j| j.missing().into_iter().collect())
    }

    fn evict(&mut self, jid: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.delete(jid)?;
        self.evicted.insert(jid.to_string(), now);
        Ok(())
    }

    fn miss_for(&self, jid: &str) -> CacheMiss {
        if self.evicted.contains_key(jid) {
            CacheMiss::Evicted
        } else {
            CacheMiss::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(jid: &str, targets: &[&str], at: DateTime<Utc>) -> Job {
        Job::new(
            jid.to_string(),
            "test.ping",
            vec![],
            "*",
            "glob",
            targets.iter().map(|t| t.to_string()).collect(),
        )
        .with_dispatched_at(at)
    }

    fn ret(jid: &str, minion: &str) -> JobReturn {
        JobReturn {
            minion_id: minion.to_string(),
            jid: jid.to_string(),
            success: true,
            payload: serde_json::json!(true),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn put_and_record() {
        let mut cache = JobCache::default();
        let now = Utc::now();
        cache.put_job(job_at("1", &["web1", "web2"], now)).unwrap();

        assert_eq!(cache.record_return_at(ret("1", "web1"), now).unwrap(), ReturnOutcome::Recorded);
        let job = cache.lookup("1").unwrap();
        assert_eq!(job.returns.len(), 1);
        assert_eq!(job.missing(), vec!["web2".to_string()]);
    }

    #[test]
    fn duplicate_jid_with_other_targets_is_rejected() {
        let mut cache = JobCache::default();
        let now = Utc::now();
        cache.put_job(job_at("1", &["web1"], now)).unwrap();

        let err = cache.put_job(job_at("1", &["db1"], now)).unwrap_err();
        assert!(matches!(err, BrineError::DuplicateJobId(ref jid) if jid == "1"));

        let job = cache.lookup("1").unwrap();
        assert_eq!(job.targets.iter().collect::<Vec<_>>(), vec!["web1"]);
    }

    #[test]
    fn same_jid_same_targets_is_idempotent() {
        let mut cache = JobCache::default();
        let now = Utc::now();
        cache.put_job(job_at("1", &["web1"], now)).unwrap();
        cache.record_return_at(ret("1", "web1"), now).unwrap();
        cache.put_job(job_at("1", &["web1"], now)).unwrap();
        assert_eq!(cache.lookup("1").unwrap().returns.len(), 1);
    }

    #[test]
    fn empty_target_set_is_rejected() {
        let mut cache = JobCache::default();
        assert!(matches!(
            cache.put_job(job_at("1", &[], Utc::now())),
            Err(BrineError::NoTargets(_))
        ));
    }

    #[test]
    fn return_after_eviction_is_not_tracked() {
        let mut cache = JobCache::new(Duration::hours(24));
        let t0 = Utc::now();
        cache.put_job(job_at("1", &["web1"], t0)).unwrap();

        assert_eq!(cache.evict_expired(t0 + Duration::hours(25)).unwrap(), 1);
        assert_eq!(
            cache.record_return_at(ret("1", "web1"), t0 + Duration::hours(25)).unwrap(),
            ReturnOutcome::NotTracked(CacheMiss::Evicted)
        );
        assert_eq!(cache.lookup("1").unwrap_err(), CacheMiss::Evicted);
    }

    #[test]
    fn late_return_without_eviction_pass_is_dropped() {
        let mut cache = JobCache::new(Duration::hours(24));
        let t0 = Utc::now();
        cache.put_job(job_at("1", &["web1"], t0)).unwrap();

        assert_eq!(
            cache.record_return_at(ret("1", "web1"), t0 + Duration::hours(25)).unwrap(),
            ReturnOutcome::NotTracked(CacheMiss::Evicted)
        );
        assert_eq!(cache.lookup("1").unwrap_err(), CacheMiss::Evicted);
    }

    #[test]
    fn unknown_and_disabled_are_distinct() {
        let cache = JobCache::default();
        assert_eq!(cache.lookup("nope").unwrap_err(), CacheMiss::Unknown);

        let mut disabled = JobCache::disabled();
        disabled.put_job(job_at("1", &["web1"], Utc::now())).unwrap();
        assert_eq!(disabled.lookup("1").unwrap_err(), CacheMiss::Disabled);
        assert_eq!(
            disabled.record_return(ret("1", "web1")).unwrap(),
            ReturnOutcome::NotTracked(CacheMiss::Disabled)
        );
    }

    #[test]
    fn eviction_keeps_recent_jobs() {
        let mut cache = JobCache::new(Duration::hours(24));
        let t0 = Utc::now();
        cache.put_job(job_at("old", &["web1"], t0)).unwrap();
        cache.put_job(job_at("new", &["web1"], t0 + Duration::hours(20))).unwrap();

        assert_eq!(cache.evict_expired(t0 + Duration::hours(30)).unwrap(), 1);
        assert!(cache.lookup("new").is_ok());
        assert_eq!(cache.jobs().unwrap().len(), 1);
    }

    #[test]
    fn tombstones_age_out() {
        let mut cache = JobCache::new(Duration::hours(1));
        let t0 = Utc::now();
        cache.put_job(job_at("1", &["web1"], t0)).unwrap();
        cache.evict_expired(t0 + Duration::hours(2)).unwrap();
        assert_eq!(cache.lookup("1").unwrap_err(), CacheMiss::Evicted);

        cache.evict_expired(t0 + Duration::hours(4)).unwrap();
        assert_eq!(cache.lookup("1").unwrap_err(), CacheMiss::Unknown);
    }

    #[test]
    fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = FsJobStore::new(dir.path()).unwrap();
            let mut cache = JobCache::with_store(Duration::hours(24), Box::new(store));
            cache.put_job(job_at("20240101000000000001", &["web1"], now)).unwrap();
            cache.record_return_at(ret("20240101000000000001", "web1"), now).unwrap();
        }

        let store = FsJobStore::new(dir.path()).unwrap();
        let cache = JobCache::with_store(Duration::hours(24), Box::new(store));
        let job = cache.lookup("20240101000000000001").unwrap();
        assert!(job.is_complete());
        assert_eq!(cache.jobs().unwrap().len(), 1);
    }

    #[test]
    fn fs_store_refuses_paths_outside_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let outside = job_at("20240101000000000002", &["web1"], Utc::now());
        std::fs::write(
            dir.path().join("stolen.json"),
            serde_json::to_vec(&outside).unwrap(),
        )
        .unwrap();

        let mut store = FsJobStore::new(dir.path()).unwrap();
        assert!(store.get("../stolen").unwrap().is_none());
        assert!(store.delete("../stolen").is_err());
        assert!(dir.path().join("stolen.json").exists());

        let mut escaping = outside.clone();
        escaping.jid = "../planted".into();
        assert!(store.put(&escaping).is_err());
        assert!(!dir.path().join("planted.json").exists());

        let cache = JobCache::with_store(Duration::hours(24), Box::new(store));
        assert_eq!(cache.lookup("../stolen").unwrap_err(), CacheMiss::Unknown);
    }
}
