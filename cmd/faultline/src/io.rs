//! JSONL problem input and diagnosis output.

use crate::error::CliError;
use faultline_engine::{Diagnosis, Problem};
use serde::de::DeserializeOwned;
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};
use tracing::warn;

/// Reads one `T` per line. Blank lines are skipped, invalid ones are
/// skipped with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CliError> {
    let read_error = |source| CliError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_error)?;

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(read_error)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                warn!(path = %path.display(), line = index + 1, %error, "Skipping invalid line");
            }
        }
    }
    Ok(entries)
}

pub fn read_problems(path: &Path) -> Result<Vec<Problem>, CliError> {
    read_jsonl(path)
}

/// Writes one JSON object per diagnosis. Evidence is dropped unless
/// `with_evidence` is set.
pub fn write_diagnoses(
    path: &Path,
    diagnoses: &[Diagnosis],
    with_evidence: bool,
) -> Result<(), CliError> {
    let write_error = |source| CliError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_error)?;
    let mut writer = BufWriter::new(file);

    for diagnosis in diagnoses {
        let line = if with_evidence {
            serde_json::to_string(diagnosis)?
        } else {
            serde_json::to_string(&Diagnosis {
                evidence: Vec::new(),
                ..diagnosis.clone()
            })?
        };
        writeln!(writer, "{line}").map_err(write_error)?;
    }
    writer.flush().map_err(write_error)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use faultline_engine::{CandidateKey, Category};
    use std::io::Write as _;

    #[test]
    fn skips_blank_and_invalid_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}\n\n{{not json\n{}\n",
            r#"{"problem_id": "001", "time_range": "2025-09-16 10:20:00 ~ 2025-09-16 10:25:00", "candidate_root_causes": ["ad.cpu"], "alarm_rules": ["service_avg_rt"]}"#,
            r#"{"problem_id": "002", "time_range": "2025-09-16 11:00:00 ~ 2025-09-16 11:05:00"}"#,
        )
        .unwrap();

        let problems = read_problems(file.path()).unwrap();
        let ids: Vec<&str> = problems.iter().map(|p| p.problem_id.as_str()).collect();
        assert_eq!(ids, vec!["001", "002"]);
        assert!(problems.get(1).is_some_and(|p| p.alarm_rules.is_empty()));
    }

    #[test]
    fn missing_input_is_a_read_error() {
        let result = read_problems(Path::new("/nonexistent/input.jsonl"));
        assert!(matches!(result, Err(CliError::Read { .. })));
    }

    #[test]
    fn evidence_is_written_only_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");

        let diagnosis = Diagnosis {
            problem_id: "001".to_owned(),
            root_causes: vec![CandidateKey::new("cart", Category::Cpu)],
            evidence: vec!["cart cpu spiked".to_owned()],
        };
        let empty = Diagnosis::empty("002");

        write_diagnoses(&path, &[diagnosis.clone(), empty], false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "{\"problem_id\":\"001\",\"root_causes\":[\"cart.cpu\"]}\n{\"problem_id\":\"002\",\"root_causes\":[]}\n"
        );

        write_diagnoses(&path, &[diagnosis], true).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"evidences\":[\"cart cpu spiked\"]"));
    }
}
