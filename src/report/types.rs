use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::location::CodeLocation;

/// The terminal (or pre-terminal) state of a spec.
///
/// States are totally ordered by severity. `Invalid` is never produced
/// by the engine; it only appears when decoding a report that carries a
/// state string this version does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum SpecState {
    #[default]
    Invalid = 0,
    Pending = 1,
    Skipped = 2,
    Passed = 3,
    Failed = 4,
    Panicked = 5,
    Interrupted = 6,
}

impl SpecState {
    /// All states considered a failure for suite-success purposes.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Panicked | Self::Interrupted)
    }

    /// Canonical numeric encoding.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a numeric code; unknown codes map to `Invalid`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Skipped,
            3 => Self::Passed,
            4 => Self::Failed,
            5 => Self::Panicked,
            6 => Self::Interrupted,
            _ => Self::Invalid,
        }
    }

    /// Decode a canonical string; unknown strings map to `Invalid`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "skipped" => Self::Skipped,
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "panicked" => Self::Panicked,
            "interrupted" => Self::Interrupted,
            _ => Self::Invalid,
        }
    }
}

impl std::fmt::Display for SpecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "INVALID SPEC STATE"),
            Self::Pending => write!(f, "pending"),
            Self::Skipped => write!(f, "skipped"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Panicked => write!(f, "panicked"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl Serialize for SpecState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpecState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// The kind of a registered node.
///
/// Unknown encoded values decode to `Invalid` so reports persisted by a
/// future version still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum NodeType {
    #[default]
    Invalid = 0,
    Container = 1,
    It = 2,
    BeforeEach = 3,
    JustBeforeEach = 4,
    AfterEach = 5,
    JustAfterEach = 6,
    BeforeSuite = 7,
    SynchronizedBeforeSuite = 8,
    AfterSuite = 9,
    SynchronizedAfterSuite = 10,
    ReportBeforeSuite = 11,
    ReportAfterSuite = 12,
}

impl NodeType {
    /// Whether this type is any of the passed-in types.
    pub fn is(self, types: &[NodeType]) -> bool {
        types.contains(&self)
    }

    /// Setup nodes that contribute to a spec's before-chain.
    pub fn is_setup(self) -> bool {
        matches!(self, Self::BeforeEach | Self::JustBeforeEach)
    }

    /// Teardown nodes that contribute to a spec's after-chain.
    pub fn is_teardown(self) -> bool {
        matches!(self, Self::AfterEach | Self::JustAfterEach)
    }

    /// Suite-level nodes, registered only at the top level.
    pub fn is_suite_level(self) -> bool {
        matches!(
            self,
            Self::BeforeSuite
                | Self::SynchronizedBeforeSuite
                | Self::AfterSuite
                | Self::SynchronizedAfterSuite
                | Self::ReportBeforeSuite
                | Self::ReportAfterSuite
        )
    }

    /// Canonical numeric encoding.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a canonical string; unknown strings map to `Invalid`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Container" => Self::Container,
            "It" => Self::It,
            "BeforeEach" => Self::BeforeEach,
            "JustBeforeEach" => Self::JustBeforeEach,
            "AfterEach" => Self::AfterEach,
            "JustAfterEach" => Self::JustAfterEach,
            "BeforeSuite" => Self::BeforeSuite,
            "SynchronizedBeforeSuite" => Self::SynchronizedBeforeSuite,
            "AfterSuite" => Self::AfterSuite,
            "SynchronizedAfterSuite" => Self::SynchronizedAfterSuite,
            "ReportBeforeSuite" => Self::ReportBeforeSuite,
            "ReportAfterSuite" => Self::ReportAfterSuite,
            _ => Self::Invalid,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "INVALID NODE TYPE"),
            Self::Container => write!(f, "Container"),
            Self::It => write!(f, "It"),
            Self::BeforeEach => write!(f, "BeforeEach"),
            Self::JustBeforeEach => write!(f, "JustBeforeEach"),
            Self::AfterEach => write!(f, "AfterEach"),
            Self::JustAfterEach => write!(f, "JustAfterEach"),
            Self::BeforeSuite => write!(f, "BeforeSuite"),
            Self::SynchronizedBeforeSuite => write!(f, "SynchronizedBeforeSuite"),
            Self::AfterSuite => write!(f, "AfterSuite"),
            Self::SynchronizedAfterSuite => write!(f, "SynchronizedAfterSuite"),
            Self::ReportBeforeSuite => write!(f, "ReportBeforeSuite"),
            Self::ReportAfterSuite => write!(f, "ReportAfterSuite"),
        }
    }
}

impl Serialize for NodeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// Where in the hierarchy a failure's node sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailureNodeContext {
    #[default]
    Invalid,
    /// The spec's own leaf failed.
    LeafNode,
    /// A node registered outside any container failed.
    AtTopLevel,
    /// A node belonging to an ancestor container failed; see
    /// `FailureNodeContainerIndex`.
    InContainer,
}

impl FailureNodeContext {
    /// Decode a canonical string; unknown strings map to `Invalid`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "leaf-node" => Self::LeafNode,
            "at-top-level" => Self::AtTopLevel,
            "in-container" => Self::InContainer,
            _ => Self::Invalid,
        }
    }
}

impl std::fmt::Display for FailureNodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "INVALID FAILURE NODE CONTEXT"),
            Self::LeafNode => write!(f, "leaf-node"),
            Self::AtTopLevel => write!(f, "at-top-level"),
            Self::InContainer => write!(f, "in-container"),
        }
    }
}

impl Serialize for FailureNodeContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FailureNodeContext {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// A recorded failure, attributed to the node that produced it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Failure {
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Location the failure was signalled from.
    pub location: CodeLocation,
    /// Panic payload, when the node aborted instead of failing cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_panic: Option<String>,
    /// Where in the hierarchy the failing node sits.
    pub failure_node_context: FailureNodeContext,
    /// The failing node's type.
    pub failure_node_type: NodeType,
    /// The failing node's registration location.
    pub failure_node_location: CodeLocation,
    /// Index into the container hierarchy identifying the ancestor the
    /// failing node belongs to. Meaningful only when the context is
    /// `InContainer`.
    #[serde(default)]
    pub failure_node_container_index: usize,
}

/// The immutable outcome record of one executed (or skipped) spec.
///
/// Suite-level hooks produce `SpecReport`s too, distinguished by their
/// `leaf_node_type`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpecReport {
    /// Texts of the enclosing containers, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_hierarchy_texts: Vec<String>,
    /// Registration locations of the enclosing containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_hierarchy_locations: Vec<CodeLocation>,
    pub leaf_node_type: NodeType,
    pub leaf_node_location: CodeLocation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leaf_node_text: String,
    pub state: SpecState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub run_time: Duration,
    /// How many times the spec ran, counting flake retries.
    pub num_attempts: u32,
    /// Output bodies wrote through the spec context writer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub captured_writer_output: String,
    /// Externally intercepted stdout/stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub captured_std_out_err: String,
    /// Absent when the spec did not fail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl SpecReport {
    /// Whether the spec ended in a failing state.
    pub fn failed(&self) -> bool {
        self.state.is_failure()
    }

    /// Container texts and leaf text joined into one sentence.
    pub fn full_text(&self) -> String {
        let mut parts: Vec<&str> = self
            .container_hierarchy_texts
            .iter()
            .map(String::as_str)
            .collect();
        if !self.leaf_node_text.is_empty() {
            parts.push(&self.leaf_node_text);
        }
        parts.join(" ")
    }

    /// Intercepted stdout/stderr followed by writer output.
    pub fn combined_output(&self) -> String {
        match (
            self.captured_std_out_err.is_empty(),
            self.captured_writer_output.is_empty(),
        ) {
            (true, true) => String::new(),
            (false, true) => self.captured_std_out_err.clone(),
            (true, false) => self.captured_writer_output.clone(),
            (false, false) => format!(
                "{}\n{}",
                self.captured_std_out_err, self.captured_writer_output
            ),
        }
    }

    /// The failure message, or empty when the spec did not fail.
    pub fn failure_message(&self) -> &str {
        self.failure.as_ref().map_or("", |f| f.message.as_str())
    }

    /// The failure location, when a failure was recorded.
    pub fn failure_location(&self) -> Option<&CodeLocation> {
        self.failure.as_ref().map(|f| &f.location)
    }

    /// File the spec's leaf was registered in.
    pub fn file_name(&self) -> &str {
        &self.leaf_node_location.file_name
    }

    /// Line the spec's leaf was registered at.
    pub fn line_number(&self) -> u32 {
        self.leaf_node_location.line_number
    }
}

/// The outcome of one suite run — pre-merge, one per worker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Report {
    pub suite_path: String,
    pub suite_succeeded: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub run_time: Duration,
    /// Non-spec-scoped failure condition; empty means none.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub special_suite_failure_reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spec_reports: Vec<SpecReport>,
}

impl Report {
    /// Merge another worker's report into this one.
    ///
    /// Times widen to cover both runs and `run_time` is recomputed from
    /// them; success is the logical AND. `suite_path` and a non-empty
    /// failure reason are taken from the left operand first, and spec
    /// reports concatenate in operand order, which makes the merge
    /// left-biased: callers must merge in ascending worker index for
    /// reproducible output.
    pub fn add(mut self, other: Report) -> Report {
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.run_time = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.suite_succeeded = self.suite_succeeded && other.suite_succeeded;
        if self.special_suite_failure_reason.is_empty() {
            self.special_suite_failure_reason = other.special_suite_failure_reason;
        }
        self.spec_reports.extend(other.spec_reports);
        self
    }

    /// Find a spec report by its leaf text.
    pub fn find(&self, leaf_text: &str) -> Option<&SpecReport> {
        self.spec_reports
            .iter()
            .find(|r| r.leaf_node_text == leaf_text)
    }

    /// Spec reports whose state is any of the given states.
    pub fn with_state(&self, states: &[SpecState]) -> Vec<&SpecReport> {
        self.spec_reports
            .iter()
            .filter(|r| states.contains(&r.state))
            .collect()
    }

    /// Spec reports whose leaf node type is any of the given types.
    pub fn with_leaf_node_type(&self, types: &[NodeType]) -> Vec<&SpecReport> {
        self.spec_reports
            .iter()
            .filter(|r| r.leaf_node_type.is(types))
            .collect()
    }

    /// Count of spec reports in any of the given states.
    pub fn count_with_state(&self, states: &[SpecState]) -> usize {
        self.spec_reports
            .iter()
            .filter(|r| states.contains(&r.state))
            .count()
    }

    /// Count of specs that passed only after at least one retry.
    pub fn count_of_flaked_specs(&self) -> usize {
        self.spec_reports
            .iter()
            .filter(|r| r.state == SpecState::Passed && r.num_attempts > 1)
            .count()
    }
}
