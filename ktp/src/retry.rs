//! Bounded retry helpers for the non-blocking facade.
//!
//! `send_to` fails fast with [`KtpError::NoSpace`] while the outbound queue is
//! full, and `recv_from` with [`KtpError::NoMessage`] while nothing has been
//! delivered.  Clients that would rather wait use these helpers, which retry
//! only those two conditions and back off exponentially between attempts.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::KtpError;
use crate::stack::KtpStack;
use crate::table::SocketHandle;

/// How often, and how patiently, to retry a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, the first one included.  Zero behaves as one.
    pub attempts: u32,
    pub initial_backoff: Duration,
    /// Ceiling for the doubled back-off.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Constant delay between tries.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            initial_backoff: interval,
            max_backoff: interval,
        }
    }

    /// Delay to wait after failed try number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    /// 100 tries, 100 ms apart.
    fn default() -> Self {
        Self::fixed(100, Duration::from_millis(100))
    }
}

/// Run `op` until it succeeds, fails with something other than `transient`,
/// or the policy runs out of attempts.  The last error is returned.
pub async fn retry<T>(
    policy: &RetryPolicy,
    transient: fn(&KtpError) -> bool,
    mut op: impl FnMut() -> Result<T, KtpError>,
) -> Result<T, KtpError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if transient(&e) && attempt + 1 < attempts => {
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// [`KtpStack::send_to`], retried while the outbound queue is full.
pub async fn send_with_retry(
    stack: &KtpStack,
    handle: SocketHandle,
    message: &[u8],
    dest: SocketAddr,
    policy: &RetryPolicy,
) -> Result<usize, KtpError> {
    retry(
        policy,
        |e| matches!(e, KtpError::NoSpace),
        || stack.send_to(handle, message, dest),
    )
    .await
}

/// [`KtpStack::recv_from`], retried until a message has been delivered.
pub async fn recv_with_retry(
    stack: &KtpStack,
    handle: SocketHandle,
    buf: &mut [u8],
    policy: &RetryPolicy,
) -> Result<(usize, SocketAddr), KtpError> {
    retry(
        policy,
        |e| matches!(e, KtpError::NoMessage),
        || stack.recv_from(handle, buf),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(70),
        };
        let delays: Vec<u64> = (0..5)
            .map(|n| policy.backoff(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 70, 70]);
        assert_eq!(policy.backoff(40), Duration::from_millis(70));
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(policy.backoff(0), policy.backoff(7));
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let mut calls = 0;
        let result = retry(&quick(5), |e| matches!(e, KtpError::NoSpace), || {
            calls += 1;
            if calls < 3 {
                Err(KtpError::NoSpace)
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        let mut calls = 0;
        let result: Result<(), _> = retry(&quick(4), |e| matches!(e, KtpError::NoMessage), || {
            calls += 1;
            Err(KtpError::NoMessage)
        })
        .await;
        assert!(matches!(result, Err(KtpError::NoMessage)));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry(&quick(4), |e| matches!(e, KtpError::NoSpace), || {
            calls += 1;
            Err(KtpError::InvalidHandle)
        })
        .await;
        assert!(matches!(result, Err(KtpError::InvalidHandle)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = retry(&quick(0), |_| true, || {
            calls += 1;
            Err::<(), _>(KtpError::NoSpace)
        })
        .await;
        assert_eq!(calls, 1);
    }
}
