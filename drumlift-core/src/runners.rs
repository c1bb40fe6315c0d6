//! Production stage runners.
//!
//! The separation and transcription models are external CLIs treated as
//! cooperative black boxes: we hand them an input file and a scratch
//! directory, scan their stderr for percentage lines, and kill them on
//! cancellation (they only ever write inside the scratch directory, so a
//! kill leaves nothing to corrupt).

use crate::stage::{StageContext, StageFailure, StageOutput, StageRunner};
use crate::task::Stage;
use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})(?:\.\d+)?%").expect("static regex"));

/// Spawn `argv ++ [input, scratch_dir]`, stream stderr percentages into the
/// sink, and wait for exit. Kills the child if the token fires.
async fn run_external(
    argv: &[String],
    ctx: &StageContext,
    label: &str,
) -> Result<(), StageFailure> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty {label} command"))?;

    let mut child = Command::new(program)
        .args(args)
        .arg(&ctx.input)
        .arg(&ctx.scratch_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {label} ({program})"))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("{label}: no stderr pipe"))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = String::new();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill {} child: {}", label, e);
                }
                return Err(StageFailure::Cancelled);
            }
            line = lines.next_line() => {
                match line.map_err(anyhow::Error::from)? {
                    Some(line) => {
                        if let Some(caps) = PERCENT_RE.captures(&line) {
                            if let Ok(percent) = caps[1].parse::<f32>() {
                                ctx.progress.report(percent, line.trim());
                            }
                        }
                        tail = line;
                    }
                    None => break,
                }
            }
        }
    }

    let status = child.wait().await.map_err(anyhow::Error::from)?;
    if ctx.cancel.is_cancelled() {
        return Err(StageFailure::Cancelled);
    }
    if !status.success() {
        return Err(anyhow!("{label} exited with {status}: {tail}").into());
    }
    Ok(())
}

/// Breadth-first search of the scratch directory for the file an external
/// tool produced; the tools nest outputs under input-derived folder names.
async fn find_produced(
    root: &Path,
    matches: impl Fn(&str) -> bool,
) -> Option<PathBuf> {
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path
                .file_name()
                .map(|n| matches(&n.to_string_lossy()))
                .unwrap_or(false)
            {
                return Some(path);
            }
        }
    }
    None
}

/// Isolates the drum stem from a full mix via the configured separator CLI.
#[derive(Debug)]
pub struct SeparationRunner {
    cmd: Vec<String>,
}

impl SeparationRunner {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl StageRunner for SeparationRunner {
    fn stage(&self) -> Stage {
        Stage::Separation
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageFailure> {
        ctx.progress.report(0.0, "Initializing separation engine");
        run_external(&self.cmd, &ctx, "separator").await?;

        let produced = find_produced(&ctx.scratch_dir, |name| name == "drums.wav")
            .await
            .ok_or_else(|| anyhow!("separator did not produce drums.wav"))?;
        debug!("task {}: drum stem at {:?}", ctx.task_id, produced);
        ctx.progress.report(100.0, "Drum stem isolated");
        Ok(StageOutput { produced })
    }
}

/// Converts the isolated drum audio to MIDI via the configured
/// transcription CLI.
#[derive(Debug)]
pub struct TranscriptionRunner {
    cmd: Vec<String>,
}

impl TranscriptionRunner {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl StageRunner for TranscriptionRunner {
    fn stage(&self) -> Stage {
        Stage::MidiConversion
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageFailure> {
        ctx.progress.report(0.0, "Analyzing drum transients");
        run_external(&self.cmd, &ctx, "transcriber").await?;

        let produced = find_produced(&ctx.scratch_dir, |name| name.ends_with(".mid"))
            .await
            .ok_or_else(|| anyhow!("transcriber did not produce a .mid file"))?;
        debug!("task {}: midi at {:?}", ctx.task_id, produced);
        ctx.progress.report(100.0, "MIDI extraction complete");
        Ok(StageOutput { produced })
    }
}

/// Minimum plausible drum-stem size; anything smaller means separation
/// silently produced garbage.
const MIN_DRUM_BYTES: u64 = 1000;
/// A MIDI header alone is ~14 bytes; require enough for actual notes.
const MIN_MIDI_BYTES: u64 = 100;

/// Pure-Rust post-processing check on both outputs. Input is the MIDI file
/// (previous stage's output); the drum stem comes in via `prior_outputs`.
#[derive(Debug, Default)]
pub struct OutputValidationRunner;

#[async_trait]
impl StageRunner for OutputValidationRunner {
    fn stage(&self) -> Stage {
        Stage::Validation
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutput, StageFailure> {
        ctx.progress.report(0.0, "Validating output files");

        let drum = ctx
            .prior_outputs
            .first()
            .ok_or_else(|| anyhow!("no drum stem to validate"))?;
        let drum_len = tokio::fs::metadata(drum)
            .await
            .with_context(|| format!("drum audio not found: {}", drum.display()))?
            .len();
        if drum_len < MIN_DRUM_BYTES {
            return Err(anyhow!("drum audio suspiciously small ({drum_len} bytes)").into());
        }

        let midi_len = tokio::fs::metadata(&ctx.input)
            .await
            .with_context(|| format!("MIDI file not found: {}", ctx.input.display()))?
            .len();
        if midi_len < MIN_MIDI_BYTES {
            return Err(anyhow!("MIDI file suspiciously small ({midi_len} bytes)").into());
        }
        let bytes = tokio::fs::read(&ctx.input).await.map_err(anyhow::Error::from)?;
        if !bytes.starts_with(b"MThd") {
            return Err(anyhow!("invalid MIDI header in {}", ctx.input.display()).into());
        }

        ctx.progress.report(100.0, "All outputs validated");
        Ok(StageOutput {
            produced: ctx.input.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ProgressSink;
    use crate::task::TaskId;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx(input: PathBuf, prior: Vec<PathBuf>, scratch: PathBuf) -> StageContext {
        let (sink, _rx) = ProgressSink::channel();
        StageContext {
            task_id: TaskId::new(),
            input,
            prior_outputs: prior,
            scratch_dir: scratch,
            progress: sink,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn validation_accepts_wellformed_outputs() {
        let dir = TempDir::new().unwrap();
        let drum = dir.path().join("drums.wav");
        let midi = dir.path().join("drums.mid");
        tokio::fs::write(&drum, vec![0u8; 2000]).await.unwrap();
        let mut midi_bytes = b"MThd".to_vec();
        midi_bytes.extend(vec![0u8; 200]);
        tokio::fs::write(&midi, midi_bytes).await.unwrap();

        let out = OutputValidationRunner
            .run(ctx(midi.clone(), vec![drum], dir.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(out.produced, midi);
    }

    #[tokio::test]
    async fn validation_rejects_tiny_drum_stem() {
        let dir = TempDir::new().unwrap();
        let drum = dir.path().join("drums.wav");
        let midi = dir.path().join("drums.mid");
        tokio::fs::write(&drum, b"tiny").await.unwrap();
        let mut midi_bytes = b"MThd".to_vec();
        midi_bytes.extend(vec![0u8; 200]);
        tokio::fs::write(&midi, midi_bytes).await.unwrap();

        let err = OutputValidationRunner
            .run(ctx(midi, vec![drum], dir.path().to_path_buf()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("suspiciously small"));
    }

    #[tokio::test]
    async fn validation_rejects_bad_midi_header() {
        let dir = TempDir::new().unwrap();
        let drum = dir.path().join("drums.wav");
        let midi = dir.path().join("drums.mid");
        tokio::fs::write(&drum, vec![0u8; 2000]).await.unwrap();
        tokio::fs::write(&midi, vec![0u8; 200]).await.unwrap();

        let err = OutputValidationRunner
            .run(ctx(midi, vec![drum], dir.path().to_path_buf()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid MIDI header"));
    }

    #[test]
    fn percent_regex_matches_tool_output() {
        let caps = PERCENT_RE.captures("  37%|###       | 00:42").unwrap();
        assert_eq!(&caps[1], "37");
        let caps = PERCENT_RE.captures("progress: 99.5% done").unwrap();
        assert_eq!(&caps[1], "99");
        assert!(PERCENT_RE.captures("no numbers here").is_none());
    }
}
