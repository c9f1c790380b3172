// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Filtering tests by name.
//!
//! A test is selected if its name contains any of the filter patterns as a substring. With no
//! patterns, every test is selected.

use crate::errors::TestFilterBuildError;
use aho_corasick::AhoCorasick;

/// Selects tests by name.
#[derive(Clone, Debug, Default)]
pub struct TestFilter {
    patterns: Vec<String>,
    matcher: Option<Box<AhoCorasick>>,
}

impl TestFilter {
    /// Creates a filter that selects every test.
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a new filter from substring patterns.
    ///
    /// If no patterns are passed, the filter selects every test.
    pub fn new(
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, TestFilterBuildError> {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        if patterns.is_empty() {
            return Ok(Self::all());
        }
        let matcher = Box::new(AhoCorasick::new(&patterns)?);
        Ok(Self {
            patterns,
            matcher: Some(matcher),
        })
    }

    /// Returns the patterns this filter was built from.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns true if this filter selects every test.
    pub fn is_all(&self) -> bool {
        self.matcher.is_none()
    }

    /// Returns true if the test name is selected.
    pub fn matches(&self, name: &str) -> bool {
        self.matcher
            .as_ref()
            .is_none_or(|matcher| matcher.is_match(name))
    }
}
