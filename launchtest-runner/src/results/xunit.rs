// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reading XUnit (JUnit XML) reports.

use crate::{errors::XunitParseError, reporter::RUN_ID_PROPERTY};
use launchtest_metadata::{RunCounts, TestOutcome};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

/// A parsed XUnit report.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XunitReport {
    /// The name of the root element, if it had one.
    pub name: Option<String>,

    /// The run id, from the root `uuid` attribute or a run-id property.
    pub run_id: Option<String>,

    /// The suites, in document order.
    pub suites: Vec<XunitSuite>,
}

impl XunitReport {
    /// Returns the counts summed over all suites, or `None` if the sum overflows.
    pub fn counts(&self) -> Option<RunCounts> {
        self.suites
            .iter()
            .try_fold(RunCounts::default(), |total, suite| total.checked_add(suite.counts))
    }
}

/// A `<testsuite>` element.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XunitSuite {
    /// The suite name.
    pub name: String,

    /// The counts: from attributes where present, otherwise from the `<testcase>` children.
    pub counts: RunCounts,

    /// The test cases that did not pass.
    pub non_passing: Vec<XunitTestCase>,
}

/// A `<testcase>` element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XunitTestCase {
    /// The test name.
    pub name: String,

    /// The outcome.
    pub outcome: TestOutcome,

    /// The `type` attribute of the failure, error or skipped element.
    pub kind: Option<String>,

    /// The `message` attribute of the failure, error or skipped element.
    pub message: Option<String>,

    /// The text content of the failure, error or skipped element.
    pub description: Option<String>,
}

#[derive(Debug, Default)]
struct SuiteBuilder {
    name: String,
    tests: Option<usize>,
    errors: Option<usize>,
    failures: Option<usize>,
    skipped: Option<usize>,
    children: RunCounts,
    non_passing: Vec<XunitTestCase>,
}

impl SuiteBuilder {
    fn new(start: &BytesStart<'_>) -> Result<Self, XunitParseError> {
        let mut suite = Self::default();
        for attr in start.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?;
            let count = |attribute: &str| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| XunitParseError::InvalidCount {
                        element: "testsuite".to_owned(),
                        attribute: attribute.to_owned(),
                        value: value.clone().into_owned(),
                    })
            };
            match attr.key.as_ref() {
                b"name" => suite.name = value.clone().into_owned(),
                b"tests" => suite.tests = Some(count("tests")?),
                b"errors" => suite.errors = Some(count("errors")?),
                b"failures" => suite.failures = Some(count("failures")?),
                b"skipped" => suite.skipped = Some(count("skipped")?),
                _ => {}
            }
        }
        Ok(suite)
    }

    fn add_test_case(&mut self, test_case: XunitTestCase) {
        self.children.add_outcome(test_case.outcome);
        if test_case.outcome != TestOutcome::Pass {
            self.non_passing.push(test_case);
        }
    }

    fn finish(self) -> Result<XunitSuite, XunitParseError> {
        let counts = RunCounts {
            tests: self.tests.unwrap_or(self.children.tests),
            errors: self.errors.unwrap_or(self.children.errors),
            failures: self.failures.unwrap_or(self.children.failures),
            skipped: self.skipped.unwrap_or(self.children.skipped),
        };
        if counts.checked_passed().is_none() {
            return Err(XunitParseError::InconsistentCounts { suite: self.name });
        }
        Ok(XunitSuite {
            name: self.name,
            counts,
            non_passing: self.non_passing,
        })
    }
}

fn test_case_from(start: &BytesStart<'_>) -> Result<XunitTestCase, XunitParseError> {
    let mut name = String::new();
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"name" {
            name = attr.unescape_value()?.into_owned();
        }
    }
    Ok(XunitTestCase {
        name,
        outcome: TestOutcome::Pass,
        kind: None,
        message: None,
        description: None,
    })
}

fn apply_status(
    test_case: &mut XunitTestCase,
    outcome: TestOutcome,
    start: &BytesStart<'_>,
) -> Result<(), XunitParseError> {
    // An error outranks a failure, which outranks a skip.
    let rank = |outcome| match outcome {
        TestOutcome::Pass => 0,
        TestOutcome::Skip => 1,
        TestOutcome::Fail => 2,
        TestOutcome::Error => 3,
    };
    if rank(outcome) < rank(test_case.outcome) {
        return Ok(());
    }
    test_case.outcome = outcome;
    for attr in start.attributes() {
        let attr = attr?;
        match attr.key.as_ref() {
            b"type" => test_case.kind = Some(attr.unescape_value()?.into_owned()),
            b"message" => test_case.message = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }
    Ok(())
}

fn outcome_for(name: &[u8]) -> Option<TestOutcome> {
    match name {
        b"failure" => Some(TestOutcome::Fail),
        b"error" => Some(TestOutcome::Error),
        b"skipped" => Some(TestOutcome::Skip),
        _ => None,
    }
}

/// Parses an XUnit report.
///
/// The root element is either `<testsuites>` or a single `<testsuite>`.
pub fn parse_xunit(xml: &str) -> Result<XunitReport, XunitParseError> {
    let mut reader = Reader::from_str(xml);
    let mut report = XunitReport::default();
    let mut saw_root = false;
    let mut stack: Vec<String> = Vec::new();
    let mut suite: Option<SuiteBuilder> = None;
    let mut test_case: Option<XunitTestCase> = None;
    let mut in_status = false;

    loop {
        let event = reader.read_event()?;
        let (start, is_empty) = match &event {
            Event::Start(start) => (Some(start), false),
            Event::Empty(start) => (Some(start), true),
            _ => (None, false),
        };

        if let Some(start) = start {
            let name = start.name();
            let name = name.as_ref();
            let depth = stack.len();
            match name {
                b"testsuites" if depth == 0 => {
                    saw_root = true;
                    for attr in start.attributes() {
                        let attr = attr?;
                        match attr.key.as_ref() {
                            b"name" => report.name = Some(attr.unescape_value()?.into_owned()),
                            b"uuid" => report.run_id = Some(attr.unescape_value()?.into_owned()),
                            _ => {}
                        }
                    }
                }
                b"testsuite" if depth == 0 || (depth == 1 && saw_root) => {
                    saw_root = true;
                    let builder = SuiteBuilder::new(start)?;
                    if is_empty {
                        report.suites.push(builder.finish()?);
                    } else {
                        suite = Some(builder);
                    }
                }
                b"property" if suite.is_some() && report.run_id.is_none() => {
                    let mut is_run_id = false;
                    let mut value = None;
                    for attr in start.attributes() {
                        let attr = attr?;
                        match attr.key.as_ref() {
                            b"name" => is_run_id = attr.unescape_value()? == RUN_ID_PROPERTY,
                            b"value" => value = Some(attr.unescape_value()?.into_owned()),
                            _ => {}
                        }
                    }
                    if is_run_id {
                        report.run_id = value;
                    }
                }
                b"testcase" if suite.is_some() => {
                    let case = test_case_from(start)?;
                    if is_empty {
                        if let Some(suite) = &mut suite {
                            suite.add_test_case(case);
                        }
                    } else {
                        test_case = Some(case);
                    }
                }
                _ if depth == 0 => return Err(XunitParseError::NoRoot),
                other => {
                    if let (Some(case), Some(outcome)) = (&mut test_case, outcome_for(other)) {
                        apply_status(case, outcome, start)?;
                        in_status = !is_empty;
                    }
                }
            }
            if !is_empty {
                stack.push(String::from_utf8_lossy(name).into_owned());
            }
            continue;
        }

        match event {
            Event::End(end) => {
                stack.pop();
                match end.name().as_ref() {
                    b"testcase" => {
                        if let (Some(suite), Some(case)) = (&mut suite, test_case.take()) {
                            suite.add_test_case(case);
                        }
                    }
                    b"testsuite" => {
                        if let Some(builder) = suite.take() {
                            report.suites.push(builder.finish()?);
                        }
                    }
                    name if outcome_for(name).is_some() => in_status = false,
                    _ => {}
                }
                if stack.is_empty() {
                    break;
                }
            }
            Event::Text(text) if in_status => {
                let text = text.unescape()?;
                append_description(&mut test_case, &text);
            }
            Event::CData(data) if in_status => {
                let text = String::from_utf8_lossy(&data);
                append_description(&mut test_case, &text);
            }
            Event::Eof => {
                return match stack.pop() {
                    Some(element) => Err(XunitParseError::Truncated { element }),
                    None if saw_root => Ok(report),
                    None => Err(XunitParseError::NoRoot),
                };
            }
            _ => {}
        }
    }

    Ok(report)
}

fn append_description(test_case: &mut Option<XunitTestCase>, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if let Some(case) = test_case {
        case.description
            .get_or_insert_with(String::new)
            .push_str(text);
    }
}
