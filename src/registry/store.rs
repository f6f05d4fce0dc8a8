//! Durable CSV storage for the task registry
//!
//! The on-disk format matches the original curve datasets: one row per
//! task, columns `name, modulus, samples, best_score, best_a, best_b`,
//! comma-delimited, every field quoted with `|` (embedded quote characters
//! doubled). There is no header row.
//!
//! Writes go through a temp-file-then-rename replace so an interrupt can
//! never leave a truncated registry behind: readers see either the old
//! file or the new one, nothing in between.

use crate::registry::CurveTask;
use anyhow::{bail, Context, Result};
use num_bigint::BigUint;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Quote character used by the curve CSV dialect
const QUOTE: char = '|';

/// Resolve the seed file for initial load.
///
/// Deployments ship the initial datasets under `/basedata`; if the
/// configured path does not exist yet, fall back to the seed copy with the
/// same file name.
pub fn resolve_seed_path(path: &Path) -> PathBuf {
    if path.is_file() {
        return path.to_path_buf();
    }
    match path.file_name() {
        Some(name) => Path::new("/basedata").join(name),
        None => path.to_path_buf(),
    }
}

/// Load all tasks from a CSV file
pub fn load_tasks(path: &Path) -> Result<Vec<CurveTask>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;

    let mut tasks = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let task = parse_row(line)
            .with_context(|| format!("{}: bad row at line {}", path.display(), index + 1))?;
        tasks.push(task);
    }

    Ok(tasks)
}

/// Write all tasks to a CSV file via an all-or-nothing replace
pub fn write_tasks(path: &Path, tasks: &[CurveTask]) -> Result<()> {
    let tmp_path = tmp_path_for(path);

    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        for task in tasks {
            writeln!(file, "{}", format_row(task))
                .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        }
        file.flush()
            .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to replace {} with {}",
            path.display(),
            tmp_path.display()
        )
    })?;

    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Format one task as a CSV row with every field quoted
fn format_row(task: &CurveTask) -> String {
    [
        quote(&task.name),
        quote(&task.modulus.to_string()),
        quote(&task.samples.to_string()),
        quote(&format_score(task.best_score)),
        quote(&task.best_a.to_string()),
        quote(&task.best_b.to_string()),
    ]
    .join(",")
}

fn quote(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 2);
    out.push(QUOTE);
    for ch in field.chars() {
        if ch == QUOTE {
            out.push(QUOTE);
        }
        out.push(ch);
    }
    out.push(QUOTE);
    out
}

/// Format a score so it parses back to the identical f64.
///
/// Rust's float formatting is shortest-round-trip exact in both notations;
/// scientific notation is only used to keep the `f64::MAX` sentinel (and
/// anything similarly huge) readable.
fn format_score(score: f64) -> String {
    if score.abs() >= 1e16 {
        format!("{:e}", score)
    } else {
        format!("{}", score)
    }
}

/// Parse one CSV row into a task
fn parse_row(line: &str) -> Result<CurveTask> {
    let fields = split_row(line)?;
    if fields.len() != 6 {
        bail!("expected 6 fields, got {}", fields.len());
    }

    Ok(CurveTask {
        name: fields[0].clone(),
        modulus: BigUint::from_str(&fields[1])
            .with_context(|| format!("bad modulus {:?}", fields[1]))?,
        samples: fields[2]
            .parse()
            .with_context(|| format!("bad samples count {:?}", fields[2]))?,
        best_score: fields[3]
            .parse()
            .with_context(|| format!("bad score {:?}", fields[3]))?,
        best_a: BigUint::from_str(&fields[4])
            .with_context(|| format!("bad coefficient a {:?}", fields[4]))?,
        best_b: BigUint::from_str(&fields[5])
            .with_context(|| format!("bad coefficient b {:?}", fields[5]))?,
    })
}

/// Split a comma-delimited row of `|`-quoted fields
fn split_row(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            QUOTE if in_quotes => {
                if chars.peek() == Some(&QUOTE) {
                    // Doubled quote char inside a quoted field
                    chars.next();
                    current.push(QUOTE);
                } else {
                    in_quotes = false;
                }
            }
            QUOTE => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }

    if in_quotes {
        bail!("unterminated quoted field");
    }
    fields.push(current);

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn task(name: &str, modulus: u64, samples: u64, score: f64, a: u64, b: u64) -> CurveTask {
        CurveTask {
            name: name.to_string(),
            modulus: BigUint::from(modulus),
            samples,
            best_score: score,
            best_a: BigUint::from(a),
            best_b: BigUint::from(b),
        }
    }

    #[test]
    fn test_round_trip_all_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("curves.csv");

        let big = BigUint::from_str(
            "115792089210356248762697446949407573530086143415290314195533631308867097853951",
        )
        .unwrap();
        let mut fresh = CurveTask::new("P-256 (nist)", big);
        fresh.best_score = f64::MAX; // untouched sentinel

        let tasks = vec![
            fresh,
            task("secp160r1 (secg)", 0xFFFF_FFFF_FFFF_FFC5, 48_211, 28.73110517204588, 91, 406),
            task("weird||name", 101, 7, 5.0, 0, 3),
        ];

        write_tasks(&path, &tasks).unwrap();
        let reloaded = load_tasks(&path).unwrap();

        assert_eq!(reloaded, tasks);
    }

    #[test]
    fn test_parse_python_written_row() {
        // Row as the original tooling writes it (sys.float_info.max)
        let row = "|Curve25519 (other)|,|57896044618658097711785492504343953926634992332820282019728792003956564819949|,|0|,|1.7976931348623157e+308|,|0|,|0|";
        let task = parse_row(row).unwrap();

        assert_eq!(task.name, "Curve25519 (other)");
        assert_eq!(task.samples, 0);
        assert_eq!(task.best_score, f64::MAX);
        assert_eq!(task.best_a, BigUint::from(0u32));
    }

    #[test]
    fn test_rejects_malformed_rows() {
        assert!(parse_row("|only|,|three|,|fields|").is_err());
        assert!(parse_row("|unterminated").is_err());
        assert!(parse_row("|n|,|not-a-number|,|0|,|1.0|,|0|,|0|").is_err());
    }

    #[test]
    fn test_replace_leaves_no_tmp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("curves.csv");

        write_tasks(&path, &[task("A", 101, 0, 40.0, 0, 0)]).unwrap();
        write_tasks(&path, &[task("A", 101, 5, 32.0, 1, 2)]).unwrap();

        assert!(path.is_file());
        assert!(!tmp_path_for(&path).exists());

        let reloaded = load_tasks(&path).unwrap();
        assert_eq!(reloaded[0].samples, 5);
        assert_eq!(reloaded[0].best_score, 32.0);
    }

    #[test]
    fn test_resolve_seed_path_falls_back() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("curves.csv");
        std::fs::write(&existing, "").unwrap();

        assert_eq!(resolve_seed_path(&existing), existing);

        let missing = dir.path().join("nope.csv");
        assert_eq!(
            resolve_seed_path(&missing),
            Path::new("/basedata").join("nope.csv")
        );
    }
}
