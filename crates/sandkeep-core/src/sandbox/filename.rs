//! Validation of bare file and directory names

use crate::error::{Error, Result, SandboxError};

/// Characters never accepted in a name, path separators included
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\', '\0'];

/// Device names reserved by Windows, compared case-insensitively
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone)]
pub struct FilenameValidator {
    max_length: usize,
}

impl FilenameValidator {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Check the final component of a path and hand it back unchanged
    pub fn validate<'a>(&self, name: &'a str) -> Result<&'a str> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(invalid(name, "name is empty or a relative marker".to_string()));
        }

        let length = name.chars().count();
        if length > self.max_length {
            return Err(invalid(
                name,
                format!("{} characters exceeds maximum of {}", length, self.max_length),
            ));
        }

        if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(invalid(name, format!("forbidden character {:?}", c)));
        }

        let upper = name.to_ascii_uppercase();
        if RESERVED_NAMES.contains(&upper.as_str()) {
            return Err(invalid(name, "reserved device name".to_string()));
        }

        Ok(name)
    }
}

impl Default for FilenameValidator {
    fn default() -> Self {
        Self::new(255)
    }
}

fn invalid(name: &str, reason: String) -> Error {
    Error::Sandbox(SandboxError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
