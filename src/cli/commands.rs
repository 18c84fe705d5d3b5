use anyhow::{Context, Result};
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::cli::args::{parse_object_path, parse_s3_path};
use crate::listing::{self, ListRequest, MAX_KEYS_LIMIT};
use crate::transfer::{
    DownloadTarget, ProgressSample, TaskSnapshot, TaskState, TransferManager, UploadSource,
};

/// Format bytes the way `mc ls` does (0B, 1.0KiB, 10MiB, ...)
pub fn format_bytes_compact(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{}B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if value >= 10.0 {
        format!("{:.0}{}", value, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// `2026-01-22T20:44:33.219Z` -> `2026-01-22 20:44:33 UTC`
pub fn format_s3_date(date: Option<&str>) -> String {
    match date {
        Some(s) => match s.split_once('T') {
            Some((day, rest)) => {
                let time = rest.get(..8).unwrap_or_else(|| rest.trim_end_matches('Z'));
                format!("{} {} UTC", day, time)
            }
            None => s.to_string(),
        },
        None => " ".repeat(23),
    }
}

fn new_task_id(verb: &str) -> String {
    format!("{}-{}", verb, chrono::Utc::now().timestamp_micros())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render progress until the task's sample stream closes, cancelling on Ctrl-C
async fn follow_transfer(
    manager: &TransferManager,
    task_id: &str,
    mut samples: UnboundedReceiver<ProgressSample>,
    label: String,
    show_progress: bool,
) -> Result<TaskSnapshot> {
    let pb = if show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_message(label);
        Some(pb)
    } else {
        None
    };

    let mut interrupted = false;
    loop {
        tokio::select! {
            sample = samples.recv() => match sample {
                Some(sample) => {
                    if let Some(pb) = &pb {
                        pb.set_length(sample.bytes_total);
                        pb.set_position(sample.bytes_completed);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!(task_id, "interrupted, cancelling transfer");
                manager.cancel(task_id)?;
            }
        }
    }

    let snapshot = manager.wait(task_id).await?;
    if let Some(pb) = pb {
        match snapshot.state {
            TaskState::Completed => pb.finish(),
            _ => pb.abandon(),
        }
    }

    match snapshot.state {
        TaskState::Completed => Ok(snapshot),
        state => {
            let reason = snapshot
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{:?}", state));
            anyhow::bail!("{} s3://{}/{}: {}", snapshot.task_id, snapshot.bucket, snapshot.key, reason)
        }
    }
}

/// List objects, mc-style
pub async fn cmd_ls(
    manager: &TransferManager,
    path: &str,
    recursive: bool,
    max_keys: usize,
    json: bool,
) -> Result<()> {
    let (bucket, prefix) = parse_s3_path(path)?;

    // Non-recursive listings stop at the next `/`
    let prefix = match prefix {
        Some(p) if !recursive && !p.ends_with('/') => Some(format!("{}/", p)),
        other => other,
    };

    let mut request = ListRequest::new(bucket);
    request.prefix = prefix.clone();
    if !recursive {
        request.delimiter = Some("/".to_string());
    }
    if max_keys > 0 {
        request.max_keys = max_keys.min(MAX_KEYS_LIMIT as usize) as u32;
    }

    let strip = prefix.as_deref().unwrap_or("");
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let mut printed = 0usize;
    let mut pages = listing::pages(manager.client().clone(), request);

    'pages: while let Some(page) = pages.try_next().await? {
        for dir in &page.common_prefixes {
            if max_keys > 0 && printed >= max_keys {
                break 'pages;
            }
            if json {
                writeln!(out, "{}", serde_json::json!({ "prefix": dir }))?;
            } else {
                writeln!(out, "{:25} {:>6} {}", "", "0B", dir.strip_prefix(strip).unwrap_or(dir))?;
            }
            printed += 1;
        }

        for entry in &page.entries {
            if max_keys > 0 && printed >= max_keys {
                break 'pages;
            }
            if json {
                writeln!(out, "{}", serde_json::to_string(entry)?)?;
            } else {
                let name = if recursive {
                    entry.key.as_str()
                } else {
                    entry.key.strip_prefix(strip).unwrap_or(&entry.key)
                };
                writeln!(
                    out,
                    "[{}] {:>6} {}",
                    format_s3_date(entry.last_modified.as_deref()),
                    format_bytes_compact(entry.size),
                    name
                )?;
            }
            printed += 1;
        }
    }

    out.flush()?;
    Ok(())
}

/// Upload a local file
pub async fn cmd_put(
    manager: &TransferManager,
    source: &Path,
    destination: &str,
    json: bool,
) -> Result<()> {
    let metadata = tokio::fs::metadata(source)
        .await
        .with_context(|| format!("Failed to stat {}", source.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a regular file", source.display());
    }

    let (bucket, key) = parse_s3_path(destination)?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", source.display()))?;
    // A missing key or a trailing slash means "into this prefix"
    let key = match key {
        Some(k) if k.ends_with('/') => format!("{}{}", k, file_name),
        Some(k) => k,
        None => file_name,
    };

    let task_id = new_task_id("put");
    let samples = manager.subscribe(&task_id);
    manager.submit_upload(&bucket, &key, UploadSource::File(source.to_path_buf()), &task_id)?;

    let label = format!("{} -> s3://{}/{}", source.display(), bucket, key);
    let snapshot = follow_transfer(manager, &task_id, samples, label, !json).await?;
    if json {
        print_json(&snapshot)?;
    } else {
        println!(
            "{} -> s3://{}/{} ({})",
            source.display(),
            bucket,
            key,
            format_bytes_compact(snapshot.bytes_total)
        );
    }
    Ok(())
}

/// Download an object to a local file
pub async fn cmd_get(
    manager: &TransferManager,
    source: &str,
    destination: Option<&Path>,
    json: bool,
) -> Result<()> {
    let (bucket, key) = parse_object_path(source)?;
    let base_name = key.rsplit('/').next().unwrap_or(&key).to_string();

    let target: PathBuf = match destination {
        Some(dest) if dest.is_dir() => dest.join(&base_name),
        Some(dest) => dest.to_path_buf(),
        None => PathBuf::from(&base_name),
    };
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let task_id = new_task_id("get");
    let samples = manager.subscribe(&task_id);
    manager.submit_download(&bucket, &key, DownloadTarget::File(target.clone()), &task_id)?;

    let label = format!("s3://{}/{} -> {}", bucket, key, target.display());
    let snapshot = follow_transfer(manager, &task_id, samples, label, !json).await?;
    if json {
        print_json(&snapshot)?;
    } else {
        println!(
            "s3://{}/{} -> {} ({})",
            bucket,
            key,
            target.display(),
            format_bytes_compact(snapshot.bytes_total)
        );
    }
    Ok(())
}

/// Delete an object, or every object under a prefix
pub async fn cmd_rm(manager: &TransferManager, path: &str, recursive: bool) -> Result<()> {
    let (bucket, key) = parse_s3_path(path)?;

    if !recursive {
        let key = key.ok_or_else(|| anyhow::anyhow!("Object key required (use --recursive for a prefix)"))?;
        manager.delete_object(&bucket, &key).await?;
        println!("Removed s3://{}/{}", bucket, key);
        return Ok(());
    }

    let mut objects = manager.list_objects(&bucket, key.as_deref(), None, None);
    let mut removed = 0usize;
    while let Some(object) = objects.try_next().await? {
        manager.delete_object(&bucket, &object.key).await?;
        println!("Removed s3://{}/{}", bucket, object.key);
        removed += 1;
    }
    println!("Total removed: {} objects", removed);
    Ok(())
}

/// Show object metadata
pub async fn cmd_stat(manager: &TransferManager, path: &str, json: bool) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;

    let meta = manager
        .find_object(&bucket, &key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Object not found: s3://{}/{}", bucket, key))?;

    if json {
        return print_json(&meta);
    }
    println!("Object: s3://{}/{}", bucket, key);
    println!("Size: {} ({})", format_bytes_compact(meta.content_length), meta.content_length);
    println!("Last Modified: {}", meta.last_modified.as_deref().unwrap_or("Unknown"));
    println!("ETag: {}", meta.etag);
    if let Some(content_type) = &meta.content_type {
        println!("Content-Type: {}", content_type);
    }
    Ok(())
}

/// Print a presigned GET URL
pub fn cmd_presign(manager: &TransferManager, path: &str, expires: Duration, json: bool) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;
    let url = manager.presigned_url(&bucket, &key, expires)?;
    if json {
        print_json(&serde_json::json!({ "url": url, "expires_in": expires.as_secs() }))
    } else {
        println!("{}", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_compact() {
        assert_eq!(format_bytes_compact(0), "0B");
        assert_eq!(format_bytes_compact(1023), "1023B");
        assert_eq!(format_bytes_compact(1536), "1.5KiB");
        assert_eq!(format_bytes_compact(64 * 1024 * 1024), "64MiB");
    }

    #[test]
    fn test_format_s3_date() {
        assert_eq!(
            format_s3_date(Some("2026-01-22T20:44:33.219Z")),
            "2026-01-22 20:44:33 UTC"
        );
        assert_eq!(format_s3_date(Some("yesterday")), "yesterday");
        assert_eq!(format_s3_date(None).len(), 23);
    }
}
