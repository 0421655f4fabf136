//! Command token registry.
//!
//! Every command is issued under a fresh [`CommandToken`]. The device answers
//! asynchronously and the registry hands the pending context back exactly
//! once. A single device connection never has more than one command in
//! flight, so the registry holds one slot and refuses to issue while it is
//! occupied.

use std::fmt;

use tracing::{debug, warn};

use crate::error::SessionError;
use crate::protocol::CommandKind;

/// Opaque correlator between an issued command and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandToken(u64);

impl CommandToken {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Context of the command currently awaiting a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub token: CommandToken,
    pub kind: CommandKind,
}

/// Single-slot token registry.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    last_issued: u64,
    outstanding: Option<PendingCommand>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for `kind`.
    ///
    /// Fails with [`SessionError::InvariantViolation`] while another command
    /// is still outstanding.
    pub fn issue(&mut self, kind: CommandKind) -> Result<CommandToken, SessionError> {
        if let Some(pending) = &self.outstanding {
            return Err(SessionError::InvariantViolation(format!(
                "cannot issue {} while {} {} is outstanding",
                kind, pending.kind, pending.token
            )));
        }
        self.last_issued += 1;
        let token = CommandToken(self.last_issued);
        self.outstanding = Some(PendingCommand { token, kind });
        debug!(token = %token, kind = %kind, "Token issued");
        Ok(token)
    }

    /// Take the pending context matching `token`.
    ///
    /// Returns `None` for late or duplicate responses and leaves the
    /// outstanding command untouched.
    pub fn resolve(&mut self, token: CommandToken) -> Option<PendingCommand> {
        match self.outstanding {
            Some(pending) if pending.token == token => self.outstanding.take(),
            _ => {
                warn!(token = %token, "Response does not match an outstanding command");
                None
            }
        }
    }

    /// Currently outstanding command, if any.
    pub fn outstanding(&self) -> Option<&PendingCommand> {
        self.outstanding.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none()
    }

    /// Drop the outstanding context on session teardown.
    pub fn release(&mut self) -> Option<PendingCommand> {
        self.outstanding.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let mut registry = TokenRegistry::new();
        let mut seen = Vec::new();
        for _ in 0..16 {
            let token = registry.issue(CommandKind::ReadBlock).unwrap();
            assert!(!seen.contains(&token));
            seen.push(token);
            assert!(registry.resolve(token).is_some());
        }
    }

    #[test]
    fn test_issue_while_outstanding_fails() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue(CommandKind::Startup).unwrap();
        let err = registry.issue(CommandKind::Login).unwrap_err();
        assert!(matches!(err, SessionError::InvariantViolation(_)));
        // The first command is still the outstanding one.
        assert_eq!(registry.outstanding().unwrap().token, token);
    }

    #[test]
    fn test_resolve_unknown_token_is_noop() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue(CommandKind::Logout).unwrap();
        assert!(registry.resolve(CommandToken::from_raw(999)).is_none());
        assert!(!registry.is_idle());

        let pending = registry.resolve(token).unwrap();
        assert_eq!(pending.kind, CommandKind::Logout);
        assert!(registry.is_idle());

        // Duplicate response for the same token.
        assert!(registry.resolve(token).is_none());
    }

    #[test]
    fn test_release_discards_context() {
        let mut registry = TokenRegistry::new();
        let token = registry.issue(CommandKind::Wipe).unwrap();
        assert!(registry.release().is_some());
        assert!(registry.resolve(token).is_none());
        let next = registry.issue(CommandKind::Startup).unwrap();
        assert!(next > token);
    }
}
