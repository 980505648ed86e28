//! Two-step confirmation for destructive administrative commands.
//!
//! The first call issues a short code to the sender; the second must echo it
//! within the TTL. A code is consumed by the first confirmation attempt,
//! right or wrong.

use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

const CODE_LENGTH: usize = 6;
const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeRejection {
    #[error("no confirmation code was issued to this sender")]
    NoPendingCode,
    #[error("confirmation code does not match")]
    WrongCode,
    #[error("confirmation code expired")]
    Expired,
}

struct PendingCode {
    code: String,
    issued: Instant,
}

pub struct PurgeGuard {
    pending: DashMap<String, PendingCode>,
    ttl: Duration,
}

fn generate_code() -> String {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

impl PurgeGuard {
    pub fn new(ttl: Duration) -> Self {
        Self { pending: DashMap::new(), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh code for `sender`, replacing any outstanding one.
    pub fn issue(&self, sender: &str) -> String {
        let code = generate_code();
        self.pending.insert(
            sender.to_string(),
            PendingCode { code: code.clone(), issued: Instant::now() },
        );
        info!(sender, "Issued purge confirmation code");
        code
    }

    /// Consume `sender`'s code and check it.
    pub fn confirm(&self, sender: &str, code: &str) -> Result<(), PurgeRejection> {
        let Some((_, pending)) = self.pending.remove(sender) else {
            return Err(PurgeRejection::NoPendingCode);
        };
        if pending.issued.elapsed() > self.ttl {
            warn!(sender, "Purge confirmation code expired");
            return Err(PurgeRejection::Expired);
        }
        if pending.code != code {
            warn!(sender, "Purge confirmation code mismatch");
            return Err(PurgeRejection::WrongCode);
        }
        Ok(())
    }

    pub fn has_pending(&self, sender: &str) -> bool {
        self.pending.contains_key(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_shape() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let guard = PurgeGuard::new(Duration::from_secs(10));
        let code = guard.issue("ops");
        assert!(guard.confirm("ops", &code).is_ok());
        assert_eq!(guard.confirm("ops", &code), Err(PurgeRejection::NoPendingCode));
    }

    #[tokio::test]
    async fn test_wrong_code_is_consumed() {
        let guard = PurgeGuard::new(Duration::from_secs(10));
        let code = guard.issue("ops");
        let wrong = if code == "aaaaaa" { "bbbbbb" } else { "aaaaaa" };
        assert_eq!(guard.confirm("ops", wrong), Err(PurgeRejection::WrongCode));
        assert!(!guard.has_pending("ops"));
        assert_eq!(guard.confirm("ops", &code), Err(PurgeRejection::NoPendingCode));
    }

    #[tokio::test]
    async fn test_codes_are_per_sender() {
        let guard = PurgeGuard::new(Duration::from_secs(10));
        let code = guard.issue("alice");
        assert_eq!(guard.confirm("bob", &code), Err(PurgeRejection::NoPendingCode));
        assert!(guard.confirm("alice", &code).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_expires() {
        let guard = PurgeGuard::new(Duration::from_secs(10));
        let code = guard.issue("ops");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(guard.confirm("ops", &code), Err(PurgeRejection::Expired));
        assert!(!guard.has_pending("ops"));
    }
}
