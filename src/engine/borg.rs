use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ArchiveInfo, BackupEngine, BackupProgress, Completed, EngineError, EngineResult, PruneSummary,
    RepositoryInfo,
};
use crate::schedule::policy::PruningPolicy;
use crate::storage::{BackupProfile, Repository};

/// Stderr lines kept around to explain a failure.
const ERROR_TAIL_LINES: usize = 50;

static PRUNE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(Keeping archive|Pruning archive|Would prune)[^:]*:\s+(\S+)")
        .expect("prune line pattern is valid")
});

/// One line of `--log-json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogLine {
    ArchiveProgress {
        #[serde(default)]
        nfiles: u64,
        #[serde(default)]
        finished: bool,
    },
    LogMessage {
        #[serde(default)]
        levelname: String,
        #[serde(default)]
        message: String,
    },
    FileStatus,
    #[serde(other)]
    Other,
}

/// Drives the `borg` binary.
pub struct BorgEngine {
    binary: PathBuf,
    lock_wait: Duration,
}

impl BorgEngine {
    pub fn new(binary: impl Into<PathBuf>, lock_wait: Duration) -> Self {
        Self {
            binary: binary.into(),
            lock_wait,
        }
    }

    fn command(&self, password: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("BORG_PASSPHRASE", password)
            .env("BORG_EXIT_CODES", "modern")
            .env("BORG_RELOCATED_REPO_ACCESS_IS_OK", "yes")
            .env("BORG_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK", "yes")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn lock_wait_args(&self) -> [String; 2] {
        ["--lock-wait".to_string(), self.lock_wait.as_secs().max(1).to_string()]
    }

    /// Runs a command to completion, capturing both streams.
    async fn run(
        &self,
        cancel: &CancellationToken,
        password: &str,
        args: Vec<String>,
    ) -> EngineResult<Output> {
        let mut cmd = self.command(password, &args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| EngineError::Spawn(e.to_string()))?;
        debug!(args = %args.join(" "), "Started borg");

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| EngineError::Spawn(e.to_string()))?
            }
            _ = cancel.cancelled() => {
                // Dropping the child kills it
                info!(args = %args.join(" "), "Borg command cancelled");
                return Err(EngineError::Cancelled);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let warning = classify_exit(output.status.code(), &stderr)?;
        debug!(
            args = %args.join(" "),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Borg command finished"
        );
        Ok(Completed {
            value: output,
            warning,
        })
    }

    async fn run_unit(
        &self,
        cancel: &CancellationToken,
        password: &str,
        args: Vec<String>,
    ) -> EngineResult<()> {
        let done = self.run(cancel, password, args).await?;
        Ok(Completed {
            value: (),
            warning: done.warning,
        })
    }

    async fn count_backup_files(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
        profile: &BackupProfile,
    ) -> Result<u64, EngineError> {
        let mut args = vec![
            "create".to_string(),
            "--dry-run".to_string(),
            "--list".to_string(),
            "--log-json".to_string(),
            archive.to_string(),
        ];
        args.extend(source_args(profile));

        let done = self.run(cancel, &repo.password, args).await?;
        let stderr = String::from_utf8_lossy(&done.value.stderr);
        Ok(stderr
            .lines()
            .filter(|line| matches!(parse_line(line), Some(LogLine::FileStatus)))
            .count() as u64)
    }

    async fn compact(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        let mut args = vec!["compact".to_string()];
        args.extend(self.lock_wait_args());
        args.push(repo.location.clone());
        self.run_unit(cancel, &repo.password, args).await
    }

    async fn stream_create(
        &self,
        cancel: &CancellationToken,
        mut child: Child,
        total_files: u64,
        progress: mpsc::Sender<BackupProgress>,
    ) -> Result<Option<String>, EngineError> {
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Spawn("stderr was not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = VecDeque::with_capacity(ERROR_TAIL_LINES);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match decode_progress(&line, total_files) {
                        Some(sample) => {
                            // Receiver gone means nobody is watching
                            let _ = progress.send(sample).await;
                        }
                        None => {
                            if tail.len() == ERROR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read borg output: {}", e);
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(EngineError::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| EngineError::Spawn(e.to_string()))?,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EngineError::Cancelled);
            }
        };
        let tail: Vec<String> = tail.into_iter().collect();
        classify_exit(status.code(), &tail.join("\n"))
    }
}

#[async_trait]
impl BackupEngine for BorgEngine {
    async fn init(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        let encryption = if repo.password.is_empty() {
            "--encryption=none"
        } else {
            "--encryption=repokey-blake2"
        };
        let args = vec![
            "init".to_string(),
            encryption.to_string(),
            repo.location.clone(),
        ];
        self.run_unit(cancel, &repo.password, args).await
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        profile: &BackupProfile,
        progress: mpsc::Sender<BackupProgress>,
    ) -> EngineResult<String> {
        let archive = format!(
            "{}::{}{}",
            repo.location,
            profile.prefix,
            Local::now().format("%Y-%m-%d-%H-%M-%S")
        );
        let total_files = self
            .count_backup_files(cancel, repo, &archive, profile)
            .await?;
        info!(archive = %archive, total_files, "Starting borg create");

        let mut args = vec![
            "create".to_string(),
            "--progress".to_string(),
            "--log-json".to_string(),
        ];
        args.extend(self.lock_wait_args());
        args.push(archive.clone());
        args.extend(source_args(profile));

        let mut cmd = self.command(&repo.password, &args);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| EngineError::Spawn(e.to_string()))?;

        let warning = self
            .stream_create(cancel, child, total_files, progress)
            .await?;
        Ok(Completed {
            value: archive,
            warning,
        })
    }

    async fn list(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<Vec<ArchiveInfo>> {
        #[derive(Deserialize)]
        struct ListOutput {
            archives: Vec<RawArchive>,
        }
        #[derive(Deserialize)]
        struct RawArchive {
            name: String,
            id: String,
            #[serde(default)]
            start: Option<String>,
        }

        let mut args = vec!["list".to_string(), "--json".to_string()];
        args.extend(self.lock_wait_args());
        args.push(repo.location.clone());
        let done = self.run(cancel, &repo.password, args).await?;

        let parsed: ListOutput = serde_json::from_slice(&done.value.stdout)
            .map_err(|e| EngineError::Output(e.to_string()))?;
        let archives = parsed
            .archives
            .into_iter()
            .map(|a| ArchiveInfo {
                name: a.name,
                id: a.id,
                created_at: a.start.as_deref().and_then(parse_borg_time),
            })
            .collect();
        Ok(Completed {
            value: archives,
            warning: done.warning,
        })
    }

    async fn prune(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        prefix: &str,
        policy: &PruningPolicy,
        dry_run: bool,
    ) -> EngineResult<PruneSummary> {
        let keep = keep_args(policy);
        if keep.is_empty() {
            return Err(EngineError::Output(
                "prune needs at least one keep option".to_string(),
            ));
        }

        let mut args = vec![
            "prune".to_string(),
            "--list".to_string(),
            "--log-json".to_string(),
            "--glob-archives".to_string(),
            format!("{}*", prefix),
        ];
        args.extend(self.lock_wait_args());
        if dry_run {
            args.push("--dry-run".to_string());
        }
        args.extend(keep);
        args.push(repo.location.clone());

        let done = self.run(cancel, &repo.password, args).await?;
        let summary = decode_prune_output(&String::from_utf8_lossy(&done.value.stderr));
        let mut warning = done.warning;

        if !dry_run {
            let compacted = self.compact(cancel, repo).await?;
            warning = warning.or(compacted.warning);
        }
        Ok(Completed {
            value: summary,
            warning,
        })
    }

    async fn info(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<RepositoryInfo> {
        #[derive(Deserialize)]
        struct InfoOutput {
            cache: Cache,
        }
        #[derive(Deserialize)]
        struct Cache {
            stats: Stats,
        }
        #[derive(Deserialize)]
        struct Stats {
            total_size: u64,
            total_csize: u64,
            unique_csize: u64,
            total_chunks: u64,
        }

        let mut args = vec!["info".to_string(), "--json".to_string()];
        args.extend(self.lock_wait_args());
        args.push(repo.location.clone());
        let done = self.run(cancel, &repo.password, args).await?;

        let parsed: InfoOutput = serde_json::from_slice(&done.value.stdout)
            .map_err(|e| EngineError::Output(e.to_string()))?;
        let stats = parsed.cache.stats;
        Ok(Completed {
            value: RepositoryInfo {
                total_size: stats.total_size,
                total_compressed_size: stats.total_csize,
                unique_compressed_size: stats.unique_csize,
                total_chunks: stats.total_chunks,
            },
            warning: done.warning,
        })
    }

    async fn mount_repository(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        mount_path: &Path,
    ) -> EngineResult<()> {
        tokio::fs::create_dir_all(mount_path)
            .await
            .map_err(|e| EngineError::Spawn(format!("cannot create mount point: {}", e)))?;
        let args = vec![
            "mount".to_string(),
            repo.location.clone(),
            mount_path.display().to_string(),
        ];
        self.run_unit(cancel, &repo.password, args).await
    }

    async fn mount_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
        mount_path: &Path,
    ) -> EngineResult<()> {
        tokio::fs::create_dir_all(mount_path)
            .await
            .map_err(|e| EngineError::Spawn(format!("cannot create mount point: {}", e)))?;
        let args = vec![
            "mount".to_string(),
            format!("{}::{}", repo.location, archive),
            mount_path.display().to_string(),
        ];
        self.run_unit(cancel, &repo.password, args).await
    }

    async fn umount(&self, cancel: &CancellationToken, mount_path: &Path) -> EngineResult<()> {
        let args = vec!["umount".to_string(), mount_path.display().to_string()];
        self.run_unit(cancel, "", args).await
    }

    async fn break_lock(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        let args = vec!["break-lock".to_string(), repo.location.clone()];
        self.run_unit(cancel, &repo.password, args).await
    }

    async fn delete_repository(&self, cancel: &CancellationToken, repo: &Repository) -> EngineResult<()> {
        let mut args = vec!["delete".to_string(), "--force".to_string()];
        args.extend(self.lock_wait_args());
        args.push(repo.location.clone());

        let mut cmd = self.command(&repo.password, &args);
        cmd.env("BORG_DELETE_I_KNOW_WHAT_I_AM_DOING", "YES")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| EngineError::Spawn(e.to_string()))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| EngineError::Spawn(e.to_string()))?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        let warning = classify_exit(output.status.code(), &String::from_utf8_lossy(&output.stderr))?;
        Ok(Completed { value: (), warning })
    }

    async fn delete_archive(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
    ) -> EngineResult<()> {
        let mut args = vec!["delete".to_string()];
        args.extend(self.lock_wait_args());
        args.push(format!("{}::{}", repo.location, archive));
        let deleted = self.run_unit(cancel, &repo.password, args).await?;

        let compacted = self.compact(cancel, repo).await?;
        Ok(Completed {
            value: (),
            warning: deleted.warning.or(compacted.warning),
        })
    }

    async fn rename(
        &self,
        cancel: &CancellationToken,
        repo: &Repository,
        archive: &str,
        new_name: &str,
    ) -> EngineResult<()> {
        let mut args = vec!["rename".to_string()];
        args.extend(self.lock_wait_args());
        args.push(format!("{}::{}", repo.location, archive));
        args.push(new_name.to_string());
        self.run_unit(cancel, &repo.password, args).await
    }
}

fn source_args(profile: &BackupProfile) -> Vec<String> {
    let mut args = profile.backup_paths.clone();
    for exclude in &profile.exclude_paths {
        args.push("--exclude".to_string());
        args.push(exclude.clone());
    }
    args
}

fn keep_args(policy: &PruningPolicy) -> Vec<String> {
    let mut args = Vec::new();
    for (flag, value) in [
        ("--keep-hourly", policy.keep_hourly),
        ("--keep-daily", policy.keep_daily),
        ("--keep-weekly", policy.keep_weekly),
        ("--keep-monthly", policy.keep_monthly),
        ("--keep-yearly", policy.keep_yearly),
    ] {
        if value > 0 {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }
    if policy.keep_within_days > 0 {
        args.push("--keep-within".to_string());
        args.push(format!("{}d", policy.keep_within_days));
    }
    args
}

fn parse_line(line: &str) -> Option<LogLine> {
    serde_json::from_str(line).ok()
}

fn decode_progress(line: &str, total_files: u64) -> Option<BackupProgress> {
    match parse_line(line)? {
        LogLine::ArchiveProgress { finished: true, .. } => Some(BackupProgress {
            total_files,
            processed_files: total_files,
        }),
        LogLine::ArchiveProgress { nfiles, .. } if total_files > 0 && nfiles > 0 => {
            Some(BackupProgress {
                total_files,
                processed_files: nfiles.min(total_files),
            })
        }
        _ => None,
    }
}

fn decode_prune_output(stderr: &str) -> PruneSummary {
    let mut summary = PruneSummary::default();
    for line in stderr.lines() {
        let message = match parse_line(line) {
            Some(LogLine::LogMessage { message, .. }) => message,
            _ => continue,
        };
        if let Some(caps) = PRUNE_LINE.captures(&message) {
            let name = caps[2].to_string();
            if &caps[1] == "Keeping archive" {
                summary.kept.push(name);
            } else {
                summary.pruned.push(name);
            }
        }
    }
    summary
}

/// The most useful error message in borg's stderr.
fn error_message(stderr: &str) -> String {
    let mut fallback = None;
    for line in stderr.lines().rev() {
        match parse_line(line) {
            Some(LogLine::LogMessage { levelname, message })
                if levelname == "ERROR" || levelname == "CRITICAL" =>
            {
                return message;
            }
            Some(_) => {}
            None if fallback.is_none() && !line.trim().is_empty() => {
                fallback = Some(line.trim().to_string());
            }
            None => {}
        }
    }
    fallback.unwrap_or_default()
}

/// Maps a borg exit code to success, warning or a classified error.
fn classify_exit(code: Option<i32>, stderr: &str) -> Result<Option<String>, EngineError> {
    let message = error_message(stderr);
    let or_default = |default: &str| {
        if message.is_empty() {
            default.to_string()
        } else {
            message.clone()
        }
    };

    match code {
        Some(0) => Ok(None),
        Some(1) | Some(100..=107) => Ok(Some(or_default("borg finished with warnings"))),
        Some(3) => Err(EngineError::Cancelled),
        Some(13) => Err(EngineError::RepositoryMissing(or_default("repository does not exist"))),
        Some(50..=53) => Err(EngineError::Passphrase(or_default("incorrect passphrase"))),
        Some(73) => Err(EngineError::LockTimeout(or_default("lock timeout"))),
        Some(70..=75) => Err(EngineError::Lock(or_default("failed to acquire lock"))),
        Some(81) => Err(EngineError::SshKey(or_default("connection closed by remote host"))),
        Some(exit_code) => Err(EngineError::Failed {
            exit_code,
            message: or_default("borg failed"),
        }),
        None => Err(EngineError::Failed {
            exit_code: -1,
            message: or_default("borg was terminated by a signal"),
        }),
    }
}

fn parse_borg_time(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}
