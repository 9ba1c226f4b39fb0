//! Verification helpers for testing hostnet managers
//!
//! Provides assertion helpers over the command lines a manager executed

use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected a command containing '{expected}', got {actual:?}")]
    CommandNotExecuted { expected: String, actual: Vec<String> },

    #[error("Command containing '{unexpected}' was executed: '{command}'")]
    UnexpectedCommand { unexpected: String, command: String },

    #[error("Expected {expected} commands matching '{pattern}', found {actual}")]
    CountMismatch {
        pattern: String,
        expected: usize,
        actual: usize,
    },

    #[error("Expected '{first}' before '{second}'")]
    OrderMismatch { first: String, second: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Command execution verifier
pub struct CommandVerifier {
    captured_commands: Vec<String>,
}

impl CommandVerifier {
    /// Create a new command verifier
    pub fn new(captured_commands: Vec<String>) -> Self {
        Self { captured_commands }
    }

    fn position(&self, pattern: &str) -> Option<usize> {
        self.captured_commands
            .iter()
            .position(|cmd| cmd.contains(pattern))
    }

    /// Verify that a command containing `expected` was executed
    pub fn assert_command_executed(&self, expected: &str) -> VerifyResult<()> {
        match self.position(expected) {
            Some(_) => Ok(()),
            None => Err(VerificationError::CommandNotExecuted {
                expected: expected.to_string(),
                actual: self.captured_commands.clone(),
            }),
        }
    }

    /// Verify that no command containing `unexpected` was executed
    pub fn assert_command_not_executed(&self, unexpected: &str) -> VerifyResult<()> {
        match self.position(unexpected) {
            Some(i) => Err(VerificationError::UnexpectedCommand {
                unexpected: unexpected.to_string(),
                command: self.captured_commands[i].clone(),
            }),
            None => Ok(()),
        }
    }

    /// Verify the total number of commands executed
    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.captured_commands.len();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                pattern: "*".to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify how many commands contain `pattern`
    pub fn assert_matching_count(&self, pattern: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.count_matching(pattern);
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                pattern: pattern.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Verify that the first command containing `first` ran before the first
    /// command containing `second`
    pub fn assert_ordered(&self, first: &str, second: &str) -> VerifyResult<()> {
        match (self.position(first), self.position(second)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            _ => Err(VerificationError::OrderMismatch {
                first: first.to_string(),
                second: second.to_string(),
            }),
        }
    }

    /// Number of commands containing `pattern`
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.captured_commands
            .iter()
            .filter(|cmd| cmd.contains(pattern))
            .count()
    }

    /// Get all captured commands
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_verifier() {
        let commands = vec![
            "/sbin/brctl addbr qbr-abc".to_string(),
            "/sbin/ip link set dev qbr-abc up".to_string(),
            "/sbin/ip link set dev qvb-abc up".to_string(),
        ];

        let verifier = CommandVerifier::new(commands);

        assert!(verifier.assert_command_executed("addbr").is_ok());
        assert!(verifier.assert_command_executed("ip link").is_ok());
        assert!(verifier.assert_command_not_executed("delbr").is_ok());
        assert!(verifier.assert_command_count(3).is_ok());
        assert!(verifier.assert_matching_count("link set", 2).is_ok());
        assert!(verifier.assert_ordered("addbr", "qvb-abc up").is_ok());

        assert!(verifier.assert_command_count(2).is_err());
        assert!(verifier.assert_command_executed("nonexistent").is_err());
        assert!(verifier.assert_command_not_executed("addbr").is_err());
        assert!(verifier.assert_ordered("qvb-abc up", "addbr").is_err());
        assert!(verifier.assert_ordered("addbr", "missing").is_err());
    }
}
