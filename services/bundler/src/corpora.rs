//! Post-processing over the release directory.
//!
//! Duration sums and the corpus split are produced by external tools; bucket
//! counts and reported sentences are computed here.

use crate::catalog::ReportedSentence;
use crate::layout::{ReleaseLayout, REPORTED_FILE};
use crate::manifest::normalize_sentence;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Errors raised by post-processing steps
#[derive(Error, Debug)]
pub enum CorporaError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{command} printed an invalid duration: {output:?}")]
    InvalidDuration { command: String, output: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

async fn run(command: &str, args: &[&OsStr]) -> Result<String, CorporaError> {
    let output = Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|source| CorporaError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(CorporaError::Failed {
            command: command.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Total duration in milliseconds of the clips in `clips_dir`
#[instrument]
pub async fn sum_durations(command: &str, clips_dir: &Path) -> Result<f64, CorporaError> {
    let stdout = run(command, &[clips_dir.as_os_str()]).await?;
    let trimmed = stdout.trim();

    trimmed
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite())
        .ok_or_else(|| CorporaError::InvalidDuration {
            command: command.to_string(),
            output: trimmed.to_string(),
        })
}

/// Run the corpus split tool over the manifest and wait for it
#[instrument(skip(layout), fields(release = %layout.release_name()))]
pub async fn run_corpora_split(command: &str, layout: &ReleaseLayout) -> Result<(), CorporaError> {
    let manifest = layout.manifest_path();
    let args = [
        OsStr::new("-f"),
        manifest.as_os_str(),
        OsStr::new("-d"),
        layout.root().as_os_str(),
        OsStr::new("-v"),
    ];

    let stdout = run(command, &args).await?;
    debug!(output_bytes = stdout.len(), "Corpus split finished");
    Ok(())
}

/// Number of `\n` bytes in a file
async fn count_lines(path: &Path) -> io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut lines = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }

    Ok(lines)
}

/// Data rows of every `*.tsv` file in a locale directory, keyed by file stem
pub async fn count_buckets(locale_dir: &Path) -> io::Result<BTreeMap<String, u64>> {
    let mut buckets = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(locale_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tsv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        // The first line is the header
        let rows = count_lines(&path).await?.saturating_sub(1);
        buckets.insert(stem.to_string(), rows);
    }

    Ok(buckets)
}

/// Write `<locale>/reported.tsv` for each release locale with reports
///
/// Reports for locales outside `locales` are dropped. Returns the number of
/// reported sentences written per locale.
#[instrument(skip_all, fields(release = %layout.release_name()))]
pub async fn write_reported_sentences(
    layout: &ReleaseLayout,
    reported: &BTreeMap<String, Vec<ReportedSentence>>,
    locales: &[String],
) -> io::Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();

    for (locale, sentences) in reported {
        if !locales.contains(locale) {
            continue;
        }

        let path = layout.locale_dir(locale).join(REPORTED_FILE);
        let mut writer = BufWriter::new(tokio::fs::File::create(&path).await?);
        writer
            .write_all(b"sentence_id\tsentence\tlocale\treason\n")
            .await?;
        for row in sentences {
            let line = format!(
                "{}\t{}\t{}\t{}\n",
                row.sentence_id,
                normalize_sentence(&row.sentence),
                row.locale,
                normalize_sentence(&row.reason)
            );
            writer.write_all(line.as_bytes()).await?;
        }
        writer.flush().await?;

        counts.insert(locale.clone(), sentences.len() as u64);
    }

    info!(locales = counts.len(), "Reported sentences written");
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reported(id: &str, locale: &str) -> ReportedSentence {
        ReportedSentence {
            sentence_id: id.to_string(),
            sentence: "Bad\tsentence".to_string(),
            locale: locale.to_string(),
            reason: "offensive-language".to_string(),
        }
    }

    #[tokio::test]
    async fn test_count_buckets() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("train.tsv"), "h\na\nb\nc\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("dev.tsv"), "h\n").await.unwrap();
        tokio::fs::write(dir.path().join("empty.tsv"), "").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "x\ny\n").await.unwrap();
        tokio::fs::create_dir(dir.path().join("clips")).await.unwrap();

        let buckets = count_buckets(dir.path()).await.unwrap();

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets["train"], 3);
        assert_eq!(buckets["dev"], 0);
        assert_eq!(buckets["empty"], 0);
    }

    #[tokio::test]
    async fn test_write_reported_sentences_filters_locales() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ReleaseLayout::new(dir.path(), "rel", "common_voice", "mp3");
        tokio::fs::create_dir_all(layout.locale_dir("en")).await.unwrap();

        let reports = BTreeMap::from([
            (
                "en".to_string(),
                vec![reported("1", "en"), reported("2", "en")],
            ),
            ("xx".to_string(), vec![reported("3", "xx")]),
        ]);

        let counts = write_reported_sentences(&layout, &reports, &["en".to_string()])
            .await
            .unwrap();

        assert_eq!(counts, BTreeMap::from([("en".to_string(), 2)]));
        let contents = tokio::fs::read_to_string(layout.locale_dir("en").join(REPORTED_FILE))
            .await
            .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "sentence_id\tsentence\tlocale\treason");
        assert_eq!(lines[1], "1\tBad sentence\ten\toffensive-language");
        assert_eq!(lines.len(), 3);
        assert!(!layout.locale_dir("xx").exists());
    }

    #[tokio::test]
    async fn test_sum_durations_missing_command() {
        let err = sum_durations("definitely-not-a-real-duration-tool", Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, CorporaError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_sum_durations_parses_stdout() {
        // `echo` prints its argument back, which stands in for the tool output
        let duration = sum_durations("echo", Path::new("12345.5")).await.unwrap();
        assert_eq!(duration, 12345.5);
    }

    #[tokio::test]
    async fn test_sum_durations_rejects_non_numeric_output() {
        let err = sum_durations("echo", Path::new("n/a")).await.unwrap_err();
        assert!(matches!(err, CorporaError::InvalidDuration { .. }));
    }
}
