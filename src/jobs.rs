//! File-backed collaborators: a job list on disk feeds the mission, and each
//! generation lands as `<output_dir>/<id>.json`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::anthropic::{Generation, MessagesRequest};
use crate::coordinator::{CandidateSource, PersistenceSink};
use crate::error::PayloadError;
use crate::state_machine::{WorkUnit, WorkUnitId};

/// One entry of the job file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobSpec {
    pub id: String,
    /// The user turn. A job without it is skipped for the mission.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// Reads jobs from a `.json` array or a `.toml` file with `[[jobs]]` tables.
pub fn load_jobs(path: &Path) -> Result<Vec<JobSpec>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading job file {}", path.display()))?;

    let jobs = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str::<Vec<JobSpec>>(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => {
            toml::from_str::<JobFile>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
                .jobs
        }
    };

    let mut seen = HashSet::new();
    for job in &jobs {
        if job.id.trim().is_empty() {
            bail!("job with blank id in {}", path.display());
        }
        if job.id.contains(['/', '\\']) || job.id == "." || job.id == ".." {
            bail!("job id `{}` is not a valid file name", job.id);
        }
        if !seen.insert(job.id.as_str()) {
            bail!("duplicate job id `{}`", job.id);
        }
    }
    Ok(jobs)
}

fn output_path(dir: &Path, id: &WorkUnitId) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// A parsed job file, stamped with the modification time and length it was
/// read at.
#[derive(Debug)]
struct LoadedJobs {
    stamp: (SystemTime, u64),
    jobs: Vec<JobSpec>,
    by_id: HashMap<String, usize>,
}

impl LoadedJobs {
    fn new(stamp: (SystemTime, u64), jobs: Vec<JobSpec>) -> Self {
        let by_id = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| (job.id.clone(), i))
            .collect();
        Self { stamp, jobs, by_id }
    }

    fn get(&self, id: &WorkUnitId) -> Option<&JobSpec> {
        self.by_id.get(id.as_str()).map(|&i| &self.jobs[i])
    }
}

/// Serves the job file as candidates. A job is pending until its output
/// file exists.
#[derive(Debug)]
pub struct FileCandidateSource {
    jobs_file: PathBuf,
    output_dir: PathBuf,
    model: String,
    max_tokens: u32,
    cache: Mutex<Option<Arc<LoadedJobs>>>,
    loads: AtomicUsize,
}

impl FileCandidateSource {
    pub fn new(
        jobs_file: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            jobs_file: jobs_file.into(),
            output_dir: output_dir.into(),
            model: model.into(),
            max_tokens,
            cache: Mutex::new(None),
            loads: AtomicUsize::new(0),
        }
    }

    /// How many times the job file has been parsed.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    // Parsed once and reused until the file's mtime or length changes.
    async fn jobs(&self) -> Result<Arc<LoadedJobs>> {
        let meta = tokio::fs::metadata(&self.jobs_file)
            .await
            .with_context(|| format!("reading job file {}", self.jobs_file.display()))?;
        let stamp = (meta.modified()?, meta.len());

        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|loaded| loaded.stamp == stamp);
        if let Some(loaded) = cached {
            return Ok(loaded);
        }

        let path = self.jobs_file.clone();
        let jobs = tokio::task::spawn_blocking(move || load_jobs(&path)).await??;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = Arc::new(LoadedJobs::new(stamp, jobs));
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    async fn find(&self, id: &WorkUnitId) -> Result<Option<JobSpec>> {
        Ok(self.jobs().await?.get(id).cloned())
    }

    /// Every job still lacking an output, in file order. Used by `status`.
    pub async fn pending(&self) -> Result<Vec<JobSpec>> {
        self.pending_page(usize::MAX).await
    }

    /// The first `limit` jobs still lacking an output, in file order.
    pub async fn pending_page(&self, limit: usize) -> Result<Vec<JobSpec>> {
        let loaded = self.jobs().await?;
        let mut pending = Vec::new();
        for job in &loaded.jobs {
            if pending.len() >= limit {
                break;
            }
            let id = WorkUnitId::new(job.id.as_str());
            if !tokio::fs::try_exists(output_path(&self.output_dir, &id)).await? {
                pending.push(job.clone());
            }
        }
        Ok(pending)
    }
}

impl CandidateSource for FileCandidateSource {
    type Payload = MessagesRequest;

    async fn scan_candidates(&self, page_size: usize) -> Result<Vec<WorkUnit>> {
        let page = self.pending_page(page_size).await?;
        debug!(found = page.len(), page_size, "scanned job file");
        Ok(page.into_iter().map(|job| WorkUnit::new(job.id)).collect())
    }

    async fn count_existing_output(&self, id: &WorkUnitId) -> Result<usize> {
        let exists = tokio::fs::try_exists(output_path(&self.output_dir, id)).await?;
        Ok(usize::from(exists))
    }

    async fn has_prerequisite(&self, id: &WorkUnitId) -> Result<bool> {
        Ok(self
            .find(id)
            .await?
            .and_then(|job| job.prompt)
            .is_some_and(|p| !p.trim().is_empty()))
    }

    async fn build_payload(&self, unit: &WorkUnit) -> Result<MessagesRequest, PayloadError> {
        let job = self
            .find(&unit.id)
            .await?
            .ok_or_else(|| PayloadError::DataMissing(format!("job {} left the job file", unit.id)))?;
        let prompt = job
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PayloadError::DataMissing(format!("job {} has no prompt", unit.id)))?;

        let mut request = MessagesRequest::user(self.model.as_str(), self.max_tokens, prompt);
        request.system = job.system;
        Ok(request)
    }
}

/// Writes each generation atomically as pretty JSON.
#[derive(Debug, Clone)]
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl PersistenceSink<Generation> for FileSink {
    async fn persist(&self, id: &WorkUnitId, output: &Generation) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        let target = output_path(&self.output_dir, id);
        let tmp = self.output_dir.join(format!(".{id}.json.tmp"));
        let json = serde_json::to_vec_pretty(output)?;

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("moving output into {}", target.display()))?;
        debug!(unit = %id, path = %target.display(), "output written");
        Ok(())
    }
}
