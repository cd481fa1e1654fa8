//! Replay command - interpret a recorded frame file into trace files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use canflash_trace::FrameInterpreter;
use tracing::info;

use crate::config::Config;
use crate::replay::parse_frames;

/// Summary of a replay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: usize,
    pub interpreted: usize,
    pub trace_files: Vec<PathBuf>,
}

/// Feed every frame of `input` through the interpreter
///
/// Trace files come from the config file plus `outputs`.
pub fn replay(
    config: &Config,
    topology: Option<&Path>,
    input: &Path,
    outputs: &[PathBuf],
) -> Result<ReplaySummary> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read replay file: {}", input.display()))?;
    let frames = parse_frames(&content)
        .with_context(|| format!("Failed to parse replay file: {}", input.display()))?;

    let interpreter = FrameInterpreter::from_config(&config.interpreter);
    if let Ok(path) = config.topology_path(topology) {
        interpreter
            .load_database(&path, config.bus_index)
            .with_context(|| format!("Failed to load topology: {}", path.display()))?;
    }

    let mut trace_files = Vec::new();
    for path in config.log_files.iter().chain(outputs) {
        let opened = interpreter
            .add_log_file(path, None)
            .with_context(|| format!("Failed to open trace file: {}", path.display()))?;
        trace_files.push(opened);
    }

    interpreter.start();
    let interpreted = frames
        .iter()
        .filter_map(|frame| interpreter.handle_frame(*frame))
        .count();
    interpreter.stop();
    interpreter.remove_all_log_files();

    info!(
        frames = frames.len(),
        interpreted,
        files = trace_files.len(),
        "Replay finished"
    );
    Ok(ReplaySummary {
        frames: frames.len(),
        interpreted,
        trace_files,
    })
}
