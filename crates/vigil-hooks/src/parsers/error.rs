/// Parser error types for tool output extraction
use thiserror::Error;
use vigil_core::VigilError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("No parser registered for tool '{0}'")]
    UnknownTool(String),

    #[error("JSON parse failed at line {line}, column {col}: {msg}")]
    Json { line: usize, col: usize, msg: String },

    #[error("Malformed output: {0}")]
    Malformed(String),

    #[error("Count mismatch: tool declared {declared} issues, parsed {parsed}")]
    CountMismatch { declared: usize, parsed: usize },

    #[error("Invalid issue: {0}")]
    InvalidIssue(String),

    #[error("Empty output")]
    EmptyOutput,
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Json {
            line: err.line(),
            col: err.column(),
            msg: err.to_string(),
        }
    }
}

impl ParseError {
    /// Attribute this error to a tool
    pub fn into_vigil(self, tool: &str) -> VigilError {
        VigilError::Parsing {
            tool: tool.to_string(),
            message: self.to_string(),
        }
    }
}
