// src/worker/remux.rs

//! Remux worker: copy-mode repackaging into a staging file, verification,
//! then an atomic move to the final output path.
//!
//! Nothing is ever written at the final path except by that last rename.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::WorkerOutcome;
use crate::exec::runner::{ProcessEvent, TerminalCondition, ToolExit, ToolInvocation, ToolSignal};
use crate::session::Session;
use crate::types::ErrorKind;

use super::verify::{content_digest, verify_container};
use super::{describe_exit, fragments_intact, stop_gracefully, OutputTail, WorkerContext};

/// JSON written next to the output as `<output>.json`.
#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    session_id: &'a str,
    source: &'a str,
    quality: &'a str,
    attempt: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
    output: &'a Path,
    size_bytes: u64,
    content_digest: &'a str,
}

/// Run the remux phase for `session`.
pub async fn run(ctx: &WorkerContext, session: &Session, cancel: &CancellationToken) -> WorkerOutcome {
    let fs = ctx.fs.as_ref();

    let Some(final_path) = session.output_path.clone() else {
        return WorkerOutcome::failed(ErrorKind::Internal, "remux assigned without an output path");
    };
    if !fragments_intact(fs, &session.fragments) {
        return WorkerOutcome::failed(ErrorKind::RemuxFailed, "capture fragments are missing or empty");
    }

    let dir = ctx.remux_dir(&session.id);
    let staging = dir.join(format!("output.partial.{}", ctx.settings.container.extension()));
    let concat_list = dir.join("fragments.txt");
    let prepared = ctx
        .fresh_dir(&dir)
        .and_then(|_| fs.write(&concat_list, concat_listing(&session.fragments).as_bytes()));
    if let Err(err) = prepared {
        return WorkerOutcome::failed(ErrorKind::Internal, format!("preparing {dir:?}: {err:#}"));
    }

    let invocation = ToolInvocation::Remux {
        session_id: session.id.clone(),
        fragments: session.fragments.clone(),
        concat_list,
        output: staging.clone(),
        work_dir: dir.clone(),
    };
    let mut process = match ctx.remux_tool.start(&invocation) {
        Ok(p) => p,
        Err(err) => {
            warn!(session = %session.id, error = %err, "remux tool failed to start");
            return WorkerOutcome::failed(ErrorKind::Internal, format!("{err:#}"));
        }
    };

    info!(
        session = %session.id,
        fragments = session.fragments.len(),
        output = %final_path.display(),
        "remux started"
    );

    let tool = ctx.remux_tool.name().to_string();
    let mut tail = OutputTail::new(20);
    let mut disk_full = false;

    let exit: ToolExit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(session = %session.id, "cancellation requested; stopping remux");
                stop_gracefully(process.as_mut(), ctx.settings.grace_period, &tool).await;
                discard(ctx, &dir);
                return WorkerOutcome::Cancelled;
            }

            event = process.next_event() => match event {
                Some(ProcessEvent::Line(line)) => {
                    if ctx.remux_tool.classify(&line) == ToolSignal::Terminal(TerminalCondition::DiskExhausted) {
                        disk_full = true;
                    }
                    debug!(session = %session.id, "remux: {}", line);
                    tail.push(line);
                }
                Some(ProcessEvent::Exited(exit)) => break exit,
                None => break ToolExit::killed(),
            },
        }
    };

    if disk_full {
        discard(ctx, &dir);
        return WorkerOutcome::failed(ErrorKind::DiskExhausted, tail.summary());
    }
    if !exit.success {
        discard(ctx, &dir);
        return WorkerOutcome::failed(
            ErrorKind::RemuxFailed,
            format!("{}: {}", describe_exit(exit), tail.summary()),
        );
    }

    if let Err(err) = verify_container(fs, &staging, ctx.settings.container) {
        warn!(session = %session.id, error = %err, "remux output failed verification");
        discard(ctx, &dir);
        return WorkerOutcome::failed(ErrorKind::RemuxVerificationFailed, format!("{err:#}"));
    }
    let (digest, size) = match content_digest(fs, &staging).and_then(|d| Ok((d, fs.file_len(&staging)?))) {
        Ok(v) => v,
        Err(err) => {
            discard(ctx, &dir);
            return WorkerOutcome::failed(ErrorKind::Internal, format!("{err:#}"));
        }
    };

    // Last point at which a cancel can still keep the output away.
    if cancel.is_cancelled() {
        discard(ctx, &dir);
        return WorkerOutcome::Cancelled;
    }

    let placed = final_path
        .parent()
        .map_or(Ok(()), |parent| fs.create_dir_all(parent))
        .and_then(|_| fs.rename(&staging, &final_path));
    if let Err(err) = placed {
        discard(ctx, &dir);
        return WorkerOutcome::failed(ErrorKind::Internal, format!("{err:#}"));
    }

    if ctx.settings.write_metadata {
        if let Err(err) = write_sidecar(ctx, session, &final_path, size, &digest) {
            warn!(session = %session.id, error = %err, "failed to write metadata sidecar");
        }
    }

    // The output is in place; fragments are no longer needed.
    if let Err(err) = fs.remove_dir_all(&ctx.session_dir(&session.id)) {
        warn!(session = %session.id, error = %err, "failed to clean work dir");
    }

    info!(session = %session.id, output = %final_path.display(), size, digest = %digest, "remux complete");
    WorkerOutcome::Remuxed {
        output: final_path,
        content_hash: digest,
    }
}

/// Concat-demuxer listing: one `file '<path>'` line per fragment.
fn concat_listing(fragments: &[PathBuf]) -> String {
    fragments
        .iter()
        .map(|f| format!("file '{}'\n", f.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

fn discard(ctx: &WorkerContext, dir: &Path) {
    if let Err(err) = ctx.fs.remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %err, "failed to remove remux staging dir");
    }
}

pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

fn write_sidecar(
    ctx: &WorkerContext,
    session: &Session,
    output: &Path,
    size: u64,
    digest: &str,
) -> anyhow::Result<()> {
    let sidecar = Sidecar {
        session_id: session.id.as_str(),
        source: &session.source,
        quality: &ctx.settings.quality,
        attempt: session.attempt,
        started_at: session.started_at,
        finished_at: Utc::now(),
        output,
        size_bytes: size,
        content_digest: digest,
    };
    let json = serde_json::to_vec_pretty(&sidecar).context("serializing sidecar")?;
    ctx.fs.write(&sidecar_path(output), &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_listing_quotes_paths() {
        let listing = concat_listing(&["/w/a.ts".into(), "/w/it's.ts".into()]);
        assert_eq!(listing, "file '/w/a.ts'\nfile '/w/it'\\''s.ts'\n");
    }

    #[test]
    fn sidecar_sits_next_to_the_output() {
        assert_eq!(
            sidecar_path(Path::new("/out/20240101T000000_abcd1234.mp4")),
            PathBuf::from("/out/20240101T000000_abcd1234.mp4.json")
        );
    }
}
