//! Comparison of a results file against an answer file.

use crate::{error::CliError, io::read_jsonl};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::Path,
};
use tracing::warn;

const MISSING_RULES: &str = "<alarm_rules missing>";

#[derive(Debug, Deserialize)]
struct RootCauseLine {
    problem_id: Option<String>,
    #[serde(default)]
    root_causes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProblemLine {
    problem_id: Option<String>,
    #[serde(default)]
    alarm_rules: Vec<String>,
}

/// Root-cause sets keyed by problem id. An empty list stays an empty set.
pub fn load_root_causes(path: &Path) -> Result<HashMap<String, BTreeSet<String>>, CliError> {
    let lines: Vec<RootCauseLine> = read_jsonl(path)?;
    Ok(lines
        .into_iter()
        .filter_map(|line| match line.problem_id {
            Some(id) => Some((id, line.root_causes.into_iter().collect())),
            None => {
                warn!(path = %path.display(), "Skipping line without problem_id");
                None
            }
        })
        .collect())
}

pub fn load_alarm_rules(path: &Path) -> Result<HashMap<String, Vec<String>>, CliError> {
    let lines: Vec<ProblemLine> = read_jsonl(path)?;
    Ok(lines
        .into_iter()
        .filter_map(|line| line.problem_id.map(|id| (id, line.alarm_rules)))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub problem_id: String,
    pub expected: BTreeSet<String>,
    pub actual: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelfCheckReport {
    /// Problem ids present in either file.
    pub total: usize,
    pub matched: usize,
    /// Mismatches grouped by alarm rules, each group ordered by problem id.
    pub groups: BTreeMap<String, Vec<Mismatch>>,
}

impl SelfCheckReport {
    pub fn mismatches(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Share of problem ids whose sets are equal, zero without ids.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.matched as f64 / self.total as f64
    }
}

/// Compares over the union of ids: an id missing from one side is compared
/// against the empty set.
pub fn compare(
    answers: &HashMap<String, BTreeSet<String>>,
    results: &HashMap<String, BTreeSet<String>>,
    alarm_rules: &HashMap<String, Vec<String>>,
) -> SelfCheckReport {
    let ids: BTreeSet<&String> = answers.keys().chain(results.keys()).collect();
    let empty = BTreeSet::new();

    let mut report = SelfCheckReport {
        total: ids.len(),
        ..SelfCheckReport::default()
    };
    for id in ids {
        let expected = answers.get(id).unwrap_or(&empty);
        let actual = results.get(id).unwrap_or(&empty);
        if expected == actual {
            report.matched += 1;
            continue;
        }
        let group = alarm_rules
            .get(id)
            .map(|rules| format!("{rules:?}"))
            .unwrap_or_else(|| MISSING_RULES.to_owned());
        report.groups.entry(group).or_default().push(Mismatch {
            problem_id: id.clone(),
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }

    for group in report.groups.values_mut() {
        group.sort_by(|a, b| numeric_id(&a.problem_id).cmp(&numeric_id(&b.problem_id)));
    }
    report
}

/// Numeric ids first in value order, anything else after them by text.
fn numeric_id(id: &str) -> (bool, u64, &str) {
    match id.parse::<u64>() {
        Ok(n) => (false, n, id),
        Err(_) => (true, 0, id),
    }
}

impl fmt::Display for SelfCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total == 0 {
            return writeln!(f, "No problem ids found, nothing to compare");
        }
        if self.groups.is_empty() {
            writeln!(f, "All {} problems match", self.total)?;
        } else {
            writeln!(
                f,
                "{} problems differ, grouped by alarm rules:\n",
                self.mismatches()
            )?;
            for (index, (rules, entries)) in self.groups.iter().enumerate() {
                writeln!(
                    f,
                    "=== Group {} (alarm_rules: {rules}) {} entries ===",
                    index + 1,
                    entries.len()
                )?;
                for entry in entries {
                    writeln!(f, "problem_id: {}", entry.problem_id)?;
                    writeln!(f, "  expected: {:?}", entry.expected)?;
                    writeln!(f, "  actual:   {:?}\n", entry.actual)?;
                }
            }
        }
        writeln!(
            f,
            "Accuracy: {}/{} ({:.2}%)",
            self.matched,
            self.total,
            self.accuracy() * 100.0
        )
    }
}

pub fn run(answers: &Path, results: &Path, problems: &Path) -> Result<SelfCheckReport, CliError> {
    Ok(compare(
        &load_root_causes(answers)?,
        &load_root_causes(results)?,
        &load_alarm_rules(problems)?,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| (*k).to_owned()).collect()
    }

    fn map(entries: &[(&str, &[&str])]) -> HashMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(id, keys)| ((*id).to_owned(), set(keys)))
            .collect()
    }

    #[test]
    fn groups_mismatches_and_orders_ids_numerically() {
        let answers = map(&[
            ("10", &["cart.cpu"]),
            ("9", &["ad.memory"]),
            ("2", &["email.memory"]),
            ("3", &[]),
        ]);
        let results = map(&[
            ("10", &["cart.memory"]),
            ("9", &[]),
            ("2", &["email.memory"]),
            ("3", &[]),
            ("11", &["frontend.Failure"]),
        ]);
        let rules: HashMap<String, Vec<String>> = [("10", "service_avg_rt"), ("9", "service_avg_rt")]
            .iter()
            .map(|(id, rule)| ((*id).to_owned(), vec![(*rule).to_owned()]))
            .collect();

        let report = compare(&answers, &results, &rules);

        assert_eq!(report.total, 5);
        assert_eq!(report.matched, 2);
        assert_eq!(report.mismatches(), 3);
        let latency = report.groups.get("[\"service_avg_rt\"]");
        let ids: Vec<&str> = latency
            .map(|group| group.iter().map(|m| m.problem_id.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["9", "10"]);
        let orphan = report.groups.get(MISSING_RULES);
        assert!(orphan.is_some_and(|group| group.len() == 1));
        assert!((report.accuracy() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn empty_inputs_have_zero_accuracy() {
        let report = compare(&HashMap::new(), &HashMap::new(), &HashMap::new());
        assert_eq!(report.total, 0);
        assert!(report.accuracy().abs() < f64::EPSILON);
        assert!(report.to_string().contains("nothing to compare"));
    }

    #[test]
    fn non_numeric_ids_sort_after_numeric_ones() {
        assert!(numeric_id("7") < numeric_id("12"));
        assert!(numeric_id("12") < numeric_id("a1"));
    }

    #[test]
    fn loads_files_and_skips_lines_without_ids() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            path
        };

        let answers = write(
            "answers.jsonl",
            "{\"problem_id\": \"001\", \"root_causes\": [\"cart.cpu\"]}\n{\"root_causes\": []}\n",
        );
        let results = write(
            "results.jsonl",
            "{\"problem_id\": \"001\", \"root_causes\": [\"cart.cpu\"]}\n{\"problem_id\": \"002\"}\n",
        );
        let problems = write(
            "problems.jsonl",
            "{\"problem_id\": \"002\", \"alarm_rules\": [\"greyFailure\"]}\n",
        );

        let report = run(&answers, &results, &problems).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.matched, 1);
        assert!(report.groups.contains_key("[\"greyFailure\"]"));
        assert!(report.to_string().contains("Accuracy: 1/2 (50.00%)"));
    }
}
