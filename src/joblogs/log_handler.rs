use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::events::{WorkloadEvent, WorkloadPhase};
use crate::joblogs::compression::CompressionMethod;
use crate::object_storage::ObjectStore;

// balance between memory use and the number of read calls
const DEFAULT_BLOCK_SIZE: u64 = 6144;

/// Captures logs of running job pods to local files and archives them to
/// object storage once the pod reaches a terminal phase.
///
/// The local file survives watch reconnects; the tail of the previous
/// content is matched against the re-streamed log so nothing is duplicated.
pub struct JobLogHandler {
    client: kube::Client,
    namespace: String,
    logs_dir: PathBuf,
    num_lines_to_check: usize,
    compression: Option<CompressionMethod>,
    storage: Arc<dyn ObjectStore>,
    // tail tasks by pod name, touched only from the dispatch callback
    tails: Mutex<HashMap<String, JoinHandle<()>>>,
    // jobs with an archive task in flight
    uploads: Mutex<HashSet<String>>,
    failed_uploads: AtomicU64,
}

impl JobLogHandler {
    pub fn new(
        config: &Config,
        client: kube::Client,
        storage: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<JobLogHandler> {
        let joblogs = config
            .joblogs()
            .context("joblogs configuration section is missing")?;
        let logs_dir = PathBuf::from(joblogs.logs_dir()?);
        let num_lines_to_check = joblogs.num_lines_to_check()?;
        let compression = joblogs
            .compression_method()
            .map(|method| CompressionMethod::from_str(method).map_err(anyhow::Error::msg))
            .transpose()?;

        Ok(JobLogHandler {
            client,
            namespace: config.namespace().to_string(),
            logs_dir,
            num_lines_to_check,
            compression,
            storage,
            tails: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashSet::new()),
            failed_uploads: AtomicU64::new(0),
        })
    }

    /// Uploads that failed and left the local file in place for a retry.
    pub fn failed_uploads(&self) -> u64 {
        self.failed_uploads.load(Ordering::Relaxed)
    }

    /// Watcher callback; spawns tail and archive workers, never blocks.
    pub fn handle_event(self: &Arc<Self>, event: &WorkloadEvent) -> anyhow::Result<()> {
        let workload = &event.workload;
        let Some(job_id) = workload.job_id.clone() else {
            debug!(
                "Pod event {:?} for pod '{}' without job label - Phase: {:?}",
                event.kind, workload.name, workload.phase
            );
            return Ok(());
        };

        match workload.phase {
            WorkloadPhase::Running => self.ensure_tail(&job_id, &workload.name),
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => self.archive(
                job_id,
                workload.project.clone().unwrap_or_default(),
                workload.spider.clone().unwrap_or_default(),
            ),
            _ => {}
        }
        Ok(())
    }

    fn log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{job_id}.log"))
    }

    /// One tail worker per pod; a finished worker may be replaced after a
    /// reconnect, the tail matching keeps the file duplicate-free.
    fn ensure_tail(self: &Arc<Self>, job_id: &str, pod_name: &str) {
        let mut tails = self.tails.lock().unwrap();
        if let Some(handle) = tails.get(pod_name) {
            if !handle.is_finished() {
                return;
            }
        }

        let handler = self.clone();
        let job_id = job_id.to_string();
        let pod = pod_name.to_string();
        let handle = tokio::spawn(async move {
            if let Err(err) = handler.stream_logs(&job_id, &pod).await {
                error!("Error streaming logs for job '{}': {:#}", job_id, err);
            }
        });
        tails.insert(pod_name.to_string(), handle);
    }

    /// At most one archive task per job; duplicate terminal events while it
    /// runs are dropped, later ones no-op on the storage prefix probe.
    fn archive(self: &Arc<Self>, job_id: String, project: String, spider: String) {
        {
            let mut uploads = self.uploads.lock().unwrap();
            if !uploads.insert(job_id.clone()) {
                return;
            }
        }

        let handler = self.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.upload_finished_log(&job_id, &project, &spider).await {
                error!("Error archiving logs for job '{}': {:#}", job_id, err);
            }
            handler.uploads.lock().unwrap().remove(&job_id);
        });
    }

    async fn stream_logs(&self, job_id: &str, pod_name: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.logs_dir)
            .await
            .with_context(|| format!("cannot create logs dir {}", self.logs_dir.display()))?;
        let log_path = self.log_path(job_id);
        let tail = last_n_lines(&log_path, self.num_lines_to_check).await?;
        if tail.is_empty() {
            info!(
                "Log file '{}' is empty or not found. Starting fresh logs for job '{}'.",
                log_path.display(),
                job_id
            );
        }

        let mut main_file = OpenOptions::new().create(true).append(true).open(&log_path).await?;

        // raw stream lines land here until the tail match decides their fate
        let temp_path = tempfile::Builder::new()
            .prefix(&format!("{job_id}_logs_tmp_"))
            .suffix(".txt")
            .tempfile_in(&self.logs_dir)?
            .into_temp_path()
            .keep()?;
        let mut temp_file = OpenOptions::new().append(true).open(&temp_path).await?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        let mut lines = pods.log_stream(pod_name, &params).await?.lines();

        let mut matcher = TailMatcher::new(tail);
        while let Some(line) = lines.try_next().await? {
            temp_file.write_all(line.as_bytes()).await?;
            temp_file.write_all(b"\n").await?;

            if matcher.resynchronized() {
                main_file.write_all(line.as_bytes()).await?;
                main_file.write_all(b"\n").await?;
            } else {
                matcher.observe(&line);
            }
        }
        temp_file.flush().await?;
        main_file.flush().await?;
        drop(temp_file);
        drop(main_file);

        if matcher.covered_previous_tail() {
            // everything in the temp file is already represented
            fs::remove_file(&temp_path).await?;
            info!(
                "Removed temporary file '{}' after streaming logs for job '{}'.",
                temp_path.display(),
                job_id
            );
        } else {
            concatenate_and_delete(&log_path, &temp_path).await?;
        }
        Ok(())
    }

    async fn upload_finished_log(&self, job_id: &str, project: &str, spider: &str) -> anyhow::Result<()> {
        let log_path = self.log_path(job_id);
        let size = match fs::metadata(&log_path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                info!("Logfile not found for job '{}'", job_id);
                return Ok(());
            }
        };
        if size == 0 {
            info!("Logfile for job '{}' is empty, nothing to upload", job_id);
            return Ok(());
        }

        // the prefix also matches compressed objects from earlier runs
        let prefix = format!("logs/{project}/{spider}/{job_id}");
        if self.storage.exists_with_prefix(&prefix).await? {
            info!("Log file for job '{}' already exists in storage.", job_id);
            fs::remove_file(&log_path).await?;
            info!(
                "Removed local log file '{}' since it already exists in storage.",
                log_path.display()
            );
            return Ok(());
        }

        let plain_key = format!("logs/{project}/{spider}/{job_id}.log");
        let (upload_path, object_key, compressed) = match self.compression {
            Some(method) => {
                let input = log_path.clone();
                let result = tokio::task::spawn_blocking(move || method.compress(&input)).await?;
                match result {
                    Ok(path) => {
                        let key = format!("{plain_key}.{}", method.extension());
                        (path.clone(), key, Some(path))
                    }
                    Err(err) => {
                        error!("Compression failed, will upload uncompressed file: {}", err);
                        (log_path.clone(), plain_key, None)
                    }
                }
            }
            None => (log_path.clone(), plain_key, None),
        };

        let uploaded = self.storage.upload(&upload_path, &object_key).await;
        if let Some(path) = compressed {
            let _ = fs::remove_file(&path).await;
        }

        match uploaded {
            Ok(()) => {
                fs::remove_file(&log_path).await?;
                info!(
                    "Removed local log file '{}' after successful upload.",
                    log_path.display()
                );
                Ok(())
            }
            Err(err) => {
                // keep the local file so the next terminal event can retry
                self.failed_uploads.fetch_add(1, Ordering::Relaxed);
                Err(err).with_context(|| format!("upload of '{object_key}' failed, local file kept"))
            }
        }
    }
}

/// Cursor over the previous file tail: incoming lines advance it, a
/// mismatch resets it, and once the whole tail has been seen again the
/// stream is aligned with the file.
pub(crate) struct TailMatcher {
    tail: Vec<String>,
    matched: usize,
}

impl TailMatcher {
    pub(crate) fn new(tail: Vec<String>) -> TailMatcher {
        TailMatcher { tail, matched: 0 }
    }

    pub(crate) fn resynchronized(&self) -> bool {
        self.matched == self.tail.len()
    }

    pub(crate) fn observe(&mut self, line: &str) {
        if line == self.tail[self.matched] {
            self.matched += 1;
        } else {
            self.matched = 0;
        }
    }

    pub(crate) fn covered_previous_tail(&self) -> bool {
        self.matched >= self.tail.len()
    }
}

/// Last `num_lines` lines of a file, reading fixed-size blocks from the end
/// instead of the whole file.
pub(crate) async fn last_n_lines(path: &Path, num_lines: usize) -> std::io::Result<Vec<String>> {
    if num_lines == 0 {
        return Ok(vec![]);
    }
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!("File not found: {}", path.display());
            return Ok(vec![]);
        }
        Err(err) => return Err(err),
    };

    let mut remaining = file.metadata().await?.len();
    let mut data: Vec<u8> = Vec::new();
    while remaining > 0 {
        let block_size = remaining.min(DEFAULT_BLOCK_SIZE);
        remaining -= block_size;
        file.seek(SeekFrom::Start(remaining)).await?;
        let mut block = vec![0u8; block_size as usize];
        file.read_exact(&mut block).await?;
        block.extend_from_slice(&data);
        data = block;

        if data.iter().filter(|byte| **byte == b'\n').count() >= num_lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&data);
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    let skip = lines.len().saturating_sub(num_lines);
    Ok(lines[skip..].to_vec())
}

async fn concatenate_and_delete(main_path: &Path, temp_path: &Path) -> std::io::Result<()> {
    let mut main_file = OpenOptions::new().create(true).append(true).open(main_path).await?;
    let mut temp_file = File::open(temp_path).await?;
    tokio::io::copy(&mut temp_file, &mut main_file).await?;
    main_file.flush().await?;
    drop(temp_file);
    fs::remove_file(temp_path).await?;
    debug!(
        "Concatenated '{}' into '{}' and deleted temporary file.",
        temp_path.display(),
        main_path.display()
    );
    Ok(())
}
