//! Result codes written by the controller into the handshake

use std::collections::HashMap;
use thiserror::Error;

/// First code available for command-specific errors
pub const USER_DEFINED_BASE: u16 = 100;

/// Classification of a handshake result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Initialized,
    Running,
    Done,
    Cancelled,
    /// Command-specific error, `>= 100`
    UserDefined(u16),
    /// Any other value; always an error
    Error(u16),
}

impl ResultCode {
    pub fn code(self) -> u16 {
        match self {
            ResultCode::Initialized => 0,
            ResultCode::Running => 1,
            ResultCode::Done => 2,
            ResultCode::Cancelled => 3,
            ResultCode::UserDefined(code) | ResultCode::Error(code) => code,
        }
    }

    /// Codes 0, 1 and 2 report a successful invocation
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultCode::Initialized | ResultCode::Running | ResultCode::Done
        )
    }
}

impl From<u16> for ResultCode {
    fn from(code: u16) -> Self {
        match code {
            0 => ResultCode::Initialized,
            1 => ResultCode::Running,
            2 => ResultCode::Done,
            3 => ResultCode::Cancelled,
            c if c >= USER_DEFINED_BASE => ResultCode::UserDefined(c),
            c => ResultCode::Error(c),
        }
    }
}

/// Built-in texts, consulted after the per-translator overrides
const FALLBACK_MESSAGES: &[(u16, &str)] = &[
    (0, "Initialized"),
    (1, "Running"),
    (2, "Done"),
    (3, "Cancelled"),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslatorError {
    #[error("A message for result code {0} is already registered")]
    DuplicateCode(u16),
}

/// Maps result codes to human-readable text
#[derive(Debug, Clone, Default)]
pub struct ResultCodeTranslator {
    overrides: HashMap<u16, String>,
}

impl ResultCodeTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a translator from a list of command-specific messages
    pub fn with_messages<I, S>(messages: I) -> Result<Self, TranslatorError>
    where
        I: IntoIterator<Item = (u16, S)>,
        S: Into<String>,
    {
        let mut translator = Self::new();
        for (code, text) in messages {
            translator.add_override(code, text)?;
        }
        Ok(translator)
    }

    /// Register a message for a code; a code can only be registered once
    /// until it is removed again
    pub fn add_override(&mut self, code: u16, text: impl Into<String>) -> Result<(), TranslatorError> {
        if self.overrides.contains_key(&code) {
            return Err(TranslatorError::DuplicateCode(code));
        }
        self.overrides.insert(code, text.into());
        Ok(())
    }

    pub fn remove_override(&mut self, code: u16) -> Option<String> {
        self.overrides.remove(&code)
    }

    pub fn message(&self, code: u16) -> String {
        if let Some(text) = self.overrides.get(&code) {
            return text.clone();
        }

        FALLBACK_MESSAGES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, text)| (*text).to_string())
            .unwrap_or_else(|| format!("Unknown error: {code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ResultCode::from(0).is_success());
        assert!(ResultCode::from(1).is_success());
        assert!(ResultCode::from(2).is_success());
        assert_eq!(ResultCode::from(3), ResultCode::Cancelled);
        assert!(!ResultCode::Cancelled.is_success());
        assert_eq!(ResultCode::from(42), ResultCode::Error(42));
        assert_eq!(ResultCode::from(100), ResultCode::UserDefined(100));
        assert_eq!(ResultCode::from(512).code(), 512);
    }

    #[test]
    fn test_fallback_messages() {
        let translator = ResultCodeTranslator::new();
        assert_eq!(translator.message(2), "Done");
        assert_eq!(translator.message(3), "Cancelled");
        assert_eq!(translator.message(57), "Unknown error: 57");
    }

    #[test]
    fn test_override_takes_precedence() {
        let mut translator = ResultCodeTranslator::new();
        translator.add_override(3, "Aborted by operator").unwrap();
        translator.add_override(101, "Axis not homed").unwrap();

        assert_eq!(translator.message(3), "Aborted by operator");
        assert_eq!(translator.message(101), "Axis not homed");
        assert_eq!(translator.message(102), "Unknown error: 102");
    }

    #[test]
    fn test_duplicate_override_rejected() {
        let mut translator = ResultCodeTranslator::new();
        translator.add_override(101, "first").unwrap();
        assert_eq!(
            translator.add_override(101, "second"),
            Err(TranslatorError::DuplicateCode(101))
        );
        assert_eq!(translator.message(101), "first");

        // Replacing requires removing first
        assert_eq!(translator.remove_override(101).as_deref(), Some("first"));
        translator.add_override(101, "second").unwrap();
        assert_eq!(translator.message(101), "second");
    }

    #[test]
    fn test_with_messages() {
        let translator =
            ResultCodeTranslator::with_messages([(100, "Door open"), (101, "No part")]).unwrap();
        assert_eq!(translator.message(100), "Door open");

        let duplicate = ResultCodeTranslator::with_messages([(100, "a"), (100, "b")]);
        assert!(matches!(duplicate, Err(TranslatorError::DuplicateCode(100))));
    }
}
