use serde::{Deserialize, Serialize};

/// Source location tracking for nodes and failures.
///
/// A `CodeLocation` marks the registration site of a node or the spot a
/// failure was signalled from, used to produce helpful report entries
/// with file/line info.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CodeLocation {
    /// Path of the source file, as the compiler reports it.
    pub file_name: String,
    /// 1-based line number within the file.
    pub line_number: u32,
}

impl CodeLocation {
    /// Creates a location from a file path and line number.
    pub fn new(file_name: impl Into<String>, line_number: u32) -> Self {
        Self {
            file_name: file_name.into(),
            line_number,
        }
    }
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_name, self.line_number)
    }
}

/// Capture the call site as a [`CodeLocation`].
#[macro_export]
macro_rules! code_location {
    () => {
        $crate::util::location::CodeLocation::new(file!(), line!())
    };
}
