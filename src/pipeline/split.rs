// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Filename-pattern splitting for fan-outs
//!
//! A pattern like `sample_%_*.fastq` groups input files into branches by
//! the `%` capture (the sample id); `*` is a free wildcard. Splitting
//! returns an ordered mapping from branch id to the files that belong to
//! it, sorted by id so fan-out results are deterministic.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{SeqflowError, SeqflowResult};

/// Branch id used when a pattern carries no `%` capture
const IMPLICIT_BRANCH: &str = "all";

/// Split inputs into branches by pattern.
///
/// If nothing matches the given inputs, prior stages' input lists are
/// searched backwards, enabling patterns that address upstream data. An
/// empty result is fatal unless the pattern is the bare wildcard `*`,
/// which falls back to one implicit branch holding every input.
pub fn split_branches(
    pattern: &str,
    inputs: &[String],
    history: &[Vec<String>],
) -> SeqflowResult<BTreeMap<String, Vec<String>>> {
    let groups = match_pattern(pattern, inputs)?;
    if !groups.is_empty() {
        return Ok(groups);
    }

    for prior in history {
        let groups = match_pattern(pattern, prior)?;
        if !groups.is_empty() {
            return Ok(groups);
        }
    }

    if pattern == "*" {
        let mut all = BTreeMap::new();
        all.insert(IMPLICIT_BRANCH.to_string(), inputs.to_vec());
        return Ok(all);
    }

    Err(SeqflowError::PatternMatch {
        pattern: pattern.to_string(),
    })
}

/// Group `files` by the pattern's `%` capture.
///
/// Patterns without a path separator match against file names, so inputs
/// living in different directories still group by sample id.
pub fn match_pattern(
    pattern: &str,
    files: &[String],
) -> SeqflowResult<BTreeMap<String, Vec<String>>> {
    let regex = pattern_regex(pattern)?;
    let on_basename = !pattern.contains('/');

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in files {
        let normalized = file.replace('\\', "/");
        let candidate = if on_basename {
            Path::new(&normalized)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| normalized.clone())
        } else {
            normalized.clone()
        };

        if let Some(caps) = regex.captures(&candidate) {
            let id = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| IMPLICIT_BRANCH.to_string());
            groups.entry(id).or_default().push(file.clone());
        }
    }

    Ok(groups)
}

/// Translate a `%`/`*` pattern into an anchored regex.
fn pattern_regex(pattern: &str) -> SeqflowResult<Regex> {
    let mut expr = String::from("^");

    for c in pattern.chars() {
        match c {
            '%' => expr.push_str("([^/]*?)"),
            '*' => expr.push_str("[^/]*"),
            c if r"\.+()[]{}^$|?".contains(c) => {
                expr.push('\\');
                expr.push(c);
            }
            c => expr.push(c),
        }
    }

    expr.push('$');
    Regex::new(&expr).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_by_sample_id() {
        let inputs = strings(&[
            "sample_A_1.fastq",
            "sample_A_2.fastq",
            "sample_B_1.fastq",
        ]);

        let groups = split_branches("sample_%_*.fastq", &inputs, &[]).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups["A"], strings(&["sample_A_1.fastq", "sample_A_2.fastq"]));
        assert_eq!(groups["B"], strings(&["sample_B_1.fastq"]));
    }

    #[test]
    fn test_ids_sorted() {
        let inputs = strings(&["sample_Z_1.txt", "sample_A_1.txt"]);
        let groups = split_branches("sample_%_*.txt", &inputs, &[]).unwrap();

        let ids: Vec<&String> = groups.keys().collect();
        assert_eq!(ids, vec!["A", "Z"]);
    }

    #[test]
    fn test_basename_matching_ignores_directories() {
        let inputs = strings(&["reads/run1/sample_A_1.fastq", "reads/run2/sample_B_1.fastq"]);
        let groups = split_branches("sample_%_*.fastq", &inputs, &[]).unwrap();

        assert_eq!(groups["A"], strings(&["reads/run1/sample_A_1.fastq"]));
        assert_eq!(groups["B"], strings(&["reads/run2/sample_B_1.fastq"]));
    }

    #[test]
    fn test_no_match_is_fatal() {
        let inputs = strings(&["reads.bam"]);
        let err = split_branches("sample_%.fastq", &inputs, &[]).unwrap_err();
        assert!(matches!(err, SeqflowError::PatternMatch { .. }));
    }

    #[test]
    fn test_bare_wildcard_is_single_implicit_branch() {
        let inputs = strings(&["a.bam", "b.bam"]);
        let groups = split_branches("*", &inputs, &[]).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups["all"], inputs);
    }

    #[test]
    fn test_falls_back_to_prior_stage_inputs() {
        let inputs = strings(&["merged.bam"]);
        let history = vec![
            strings(&["also_not_matching.bam"]),
            strings(&["sample_A_1.fastq", "sample_B_1.fastq"]),
        ];

        let groups = split_branches("sample_%_*.fastq", &inputs, &history).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.contains_key("A"));
        assert!(groups.contains_key("B"));
    }

    #[test]
    fn test_pattern_without_capture_groups_together() {
        let inputs = strings(&["a.vcf", "b.vcf", "c.txt"]);
        let groups = match_pattern("*.vcf", &inputs).unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups["all"], strings(&["a.vcf", "b.vcf"]));
    }

    #[test]
    fn test_dots_are_literal() {
        let inputs = strings(&["sampleXvcf", "sample.vcf"]);
        let groups = match_pattern("sample.vcf", &inputs).unwrap();
        assert_eq!(groups["all"], strings(&["sample.vcf"]));
    }
}
