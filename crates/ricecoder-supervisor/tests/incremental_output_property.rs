//! Property-based tests for incremental output
//!
//! **Feature: ricecoder-supervisor, Property 2: Incremental Output Completeness**

#![cfg(unix)]

use std::time::Duration;

use proptest::prelude::*;
use ricecoder_supervisor::{escape_argument, ProcessConfig, ProcessSupervisor};

fn lines_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z0-9 ]{1,24}", 1..6)
}

fn printing_script(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| format!("printf '%s\\n' {}", escape_argument(line)))
        .collect::<Vec<_>>()
        .join("; sleep 0.02; ")
}

/// Incremental reads concatenate to the full output: in order, no gaps,
/// no duplication
#[test]
fn prop_incremental_reads_concatenate_to_output() {
    proptest!(ProptestConfig::with_cases(12), |(lines in lines_strategy())| {
        let mut process = ProcessSupervisor::new(
            ProcessConfig::shell(printing_script(&lines)).poll_interval(Duration::from_millis(10)),
        );
        process.start().unwrap();

        let mut collected = Vec::new();
        while process.is_running() {
            collected.extend(process.incremental_output().unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }
        process.wait().unwrap();
        collected.extend(process.incremental_output().unwrap());

        let expected: String = lines.iter().map(|line| format!("{line}\n")).collect();
        prop_assert_eq!(&collected, process.output().unwrap());
        prop_assert_eq!(collected, expected.into_bytes());
    });
}

/// After `clear_output()` only later bytes are returned
#[test]
fn prop_clear_then_incremental_returns_only_new_bytes() {
    proptest!(ProptestConfig::with_cases(8), |(
        before in "[a-z]{1,16}",
        after in "[A-Z]{1,16}"
    )| {
        let script = format!(
            "printf %s {}; sleep 0.3; printf %s {}",
            escape_argument(&before),
            escape_argument(&after)
        );
        let mut process = ProcessSupervisor::new(
            ProcessConfig::shell(script).poll_interval(Duration::from_millis(10)),
        );
        process.start().unwrap();

        let mut seen = Vec::new();
        let found = process
            .wait_until(|_, bytes| {
                seen.extend_from_slice(bytes);
                seen.len() >= before.len()
            })
            .unwrap();
        prop_assert!(found);

        process.clear_output();
        process.wait().unwrap();

        prop_assert_eq!(process.incremental_output().unwrap(), after.as_bytes().to_vec());
        prop_assert_eq!(process.output().unwrap(), after.as_bytes());
    });
}
