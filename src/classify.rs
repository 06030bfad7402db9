use std::collections::BTreeSet;

use crate::backend::ExecError;

/// MySQL `ER_LOCK_WAIT_TIMEOUT`.
pub const LOCK_WAIT_TIMEOUT: u16 = 1205;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Ignorable,
    Fatal,
}

/// Splits execution failures into transient server conditions, which the
/// replay logs and moves past, and everything else, which ends the replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    ignorable_codes: BTreeSet<u16>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new([LOCK_WAIT_TIMEOUT])
    }
}

impl ErrorClassifier {
    pub fn new(ignorable_codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ignorable_codes: ignorable_codes.into_iter().collect(),
        }
    }

    pub fn classify(&self, err: &ExecError) -> ErrorClass {
        match err {
            ExecError::Server {
                code: Some(code), ..
            } if self.ignorable_codes.contains(code) => ErrorClass::Ignorable,
            _ => ErrorClass::Fatal,
        }
    }
}
