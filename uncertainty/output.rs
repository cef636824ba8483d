// ========================================================================================
//                                 Result output
// ========================================================================================
//
// A finished phase is written as tab-separated tables plus a TOML performance summary.
// Every file is first written in full to a temporary name in the output directory.
// Only when all of them have been written and synced are they renamed into place, so a
// failure part way through leaves no partial results behind.

use crate::accumulate::{FinalResults, FinalVariance};
use crate::debug::DebugTrace;
use log::info;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SELF_VARIANCE_FILE: &str = "variance_aa.tsv";
pub const PAIR_COVARIANCE_FILE: &str = "covariance_ab.tsv";
pub const DEBUG_FILE: &str = "debug_rays.tsv";
pub const SUMMARY_FILE: &str = "summary.toml";

const VARIANCE_COLUMNS: &str =
    "diagonal\toff_diagonal\tnon_represented\ttotal\trepresented_fraction";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to serialize the performance summary: {0}")]
    Summary(#[from] toml::ser::Error),
}

fn write_variance_columns(
    writer: &mut impl Write,
    buffer: &mut ryu::Buffer,
    value: &FinalVariance,
) -> io::Result<()> {
    for field in [
        value.diagonal,
        value.off_diagonal,
        value.non_represented,
        value.total,
        value.represented_fraction,
    ] {
        write!(writer, "\t{}", buffer.format(field))?;
    }
    writeln!(writer)
}

fn write_self_variance(writer: &mut impl Write, results: &FinalResults) -> io::Result<()> {
    writeln!(writer, "phase\tsite\tsource\t{VARIANCE_COLUMNS}")?;
    let mut buffer = ryu::Buffer::new();
    for (key, value) in &results.self_variance {
        write!(writer, "{}\t{}\t{}", key.phase, key.site, key.source)?;
        write_variance_columns(writer, &mut buffer, value)?;
    }
    Ok(())
}

fn write_pair_covariance(writer: &mut impl Write, results: &FinalResults) -> io::Result<()> {
    writeln!(writer, "phase\tsite_a\tsite_b\tsource\t{VARIANCE_COLUMNS}")?;
    let mut buffer = ryu::Buffer::new();
    for (key, value) in &results.pair_covariance {
        write!(
            writer,
            "{}\t{}\t{}\t{}",
            key.phase, key.site_a, key.site_b, key.source
        )?;
        write_variance_columns(writer, &mut buffer, value)?;
    }
    Ok(())
}

fn write_debug(writer: &mut impl Write, traces: &[DebugTrace]) -> io::Result<()> {
    writeln!(
        writer,
        "task_id\tblock_row\tblock_col\tphase\tsite_a\tsite_b\tsource\trow_position\tcol_position\trow_index\tcol_index\trow_weight\tcol_weight\tlocal_row\tlocal_col\tcovariance\tcount"
    )?;
    let mut buffer = ryu::Buffer::new();
    for trace in traces {
        for entry in &trace.entries {
            write!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                trace.task_id,
                trace.block.row,
                trace.block.col,
                trace.phase,
                trace.site_a,
                trace.site_b,
                trace.source,
                entry.row_position,
                entry.col_position,
                entry.row_index,
                entry.col_index
            )?;
            write!(writer, "\t{}", buffer.format(entry.row_weight))?;
            write!(writer, "\t{}", buffer.format(entry.col_weight))?;
            write!(writer, "\t{}\t{}", entry.local_row, entry.local_col)?;
            write!(writer, "\t{}", buffer.format(entry.covariance))?;
            writeln!(writer, "\t{}", entry.count)?;
        }
    }
    Ok(())
}

/// Writes `body` to a hidden temporary file next to `dest` and syncs it.
fn stage_file<F>(dest: &Path, body: F) -> Result<PathBuf, OutputError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = dest.with_file_name(format!(".{file_name}.tmp"));

    let write_result = (|| -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        body(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(io::Error::other)?;
        file.sync_all()
    })();

    match write_result {
        Ok(()) => Ok(temp_path),
        Err(source) => {
            let _ = fs::remove_file(&temp_path);
            Err(OutputError::Io {
                path: dest.to_path_buf(),
                source,
            })
        }
    }
}

/// Writes every output table and the summary into `dir`. Returns the final
/// paths written.
pub fn write_results(dir: &Path, results: &FinalResults) -> Result<Vec<PathBuf>, OutputError> {
    fs::create_dir_all(dir).map_err(|source| OutputError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let summary = toml::to_string_pretty(&results.summary)?;

    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
    let outcome = (|| -> Result<(), OutputError> {
        let dest = dir.join(SELF_VARIANCE_FILE);
        staged.push((stage_file(&dest, |w| write_self_variance(w, results))?, dest));

        if !results.pair_covariance.is_empty() {
            let dest = dir.join(PAIR_COVARIANCE_FILE);
            staged.push((stage_file(&dest, |w| write_pair_covariance(w, results))?, dest));
        }
        if !results.debug.is_empty() {
            let dest = dir.join(DEBUG_FILE);
            staged.push((stage_file(&dest, |w| write_debug(w, &results.debug))?, dest));
        }

        let dest = dir.join(SUMMARY_FILE);
        staged.push((
            stage_file(&dest, |w| w.write_all(summary.as_bytes()))?,
            dest,
        ));
        Ok(())
    })();

    if let Err(e) = outcome {
        for (temp, _) in &staged {
            let _ = fs::remove_file(temp);
        }
        return Err(e);
    }

    let mut written = Vec::with_capacity(staged.len());
    for (temp, dest) in staged {
        fs::rename(&temp, &dest).map_err(|source| {
            let _ = fs::remove_file(&temp);
            OutputError::Io {
                path: dest.clone(),
                source,
            }
        })?;
        info!("Wrote {}", dest.display());
        written.push(dest);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::VarianceAccumulator;
    use crate::retry::WarningTrail;
    use crate::task::{TaskCounters, TaskResult, TaskTimings};
    use crate::types::{AaKey, BlockKey, PartialVariance, Phase};
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_results() -> FinalResults {
        let mut table = crate::task::SelfVarianceTable::new();
        table.insert(
            AaKey {
                phase: Phase::new("Pn").unwrap(),
                site: 3,
                source: 8,
            },
            PartialVariance {
                diagonal: 4.0,
                off_diagonal: 0.5,
                non_represented: 0.5,
            },
        );
        let mut acc = VarianceAccumulator::new();
        acc.merge(TaskResult {
            task_id: 0,
            block: BlockKey::new(0, 0),
            host: "test".to_string(),
            self_variance: Some(table),
            pair_covariance: None,
            debug: Vec::new(),
            counters: TaskCounters::default(),
            timings: TaskTimings::default(),
            warnings: WarningTrail::new(),
            failure: None,
        })
        .unwrap();
        acc.finalize(Duration::from_secs(1), 1)
    }

    #[test]
    fn results_are_written_as_tsv_with_a_summary() {
        let dir = tempdir().unwrap();
        let written = write_results(dir.path(), &sample_results()).unwrap();
        assert_eq!(written.len(), 2);

        let table = fs::read_to_string(dir.path().join(SELF_VARIANCE_FILE)).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "phase\tsite\tsource\tdiagonal\toff_diagonal\tnon_represented\ttotal\trepresented_fraction"
        );
        assert_eq!(lines[1], "Pn\t3\t8\t4.0\t0.5\t0.5\t5.0\t0.9");

        let summary = fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(summary.contains("tasks = 1"));
        assert!(!dir.path().join(PAIR_COVARIANCE_FILE).exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
