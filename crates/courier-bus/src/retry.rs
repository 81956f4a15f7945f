//! Retry policy, backoff and terminal failure handling.
//!
//! A message is handled at most `max_retries + 1` times. Between attempts the
//! consumer sleeps for an exponentially growing, jittered interval. When the
//! attempts run out (or the elapsed-time budget would be exceeded) the
//! configured [`FailureHook`] sees the envelope exactly once.

use crate::registry::HandlerError;
use crate::transport::Transport;
use async_trait::async_trait;
use courier_protocol::{metadata, panic_message, Envelope};
use futures_util::FutureExt;
use metrics::counter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, warn};

/// Default prefix of dead-letter topics.
pub const DEFAULT_DEAD_LETTER_PREFIX: &str = "dead-letter.";

/// How often and how patiently a failing message is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub initial_interval: Duration,
    /// Upper bound of the un-jittered wait.
    pub max_interval: Duration,
    /// Growth factor between waits.
    pub multiplier: f64,
    /// Jitter spread, in `[0, 1]`.
    pub randomization_factor: f64,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_elapsed_time: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl RetryPolicy {
    /// Check that the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1, got {}", self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(format!(
                "randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            ));
        }
        if self.initial_interval > self.max_interval {
            return Err("initial_interval must not exceed max_interval".to_string());
        }
        Ok(())
    }

    /// A fresh backoff sequence seeded from entropy.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self, StdRng::from_entropy())
    }

    /// A fresh backoff sequence with reproducible jitter.
    #[must_use]
    pub fn backoff_seeded(&self, seed: u64) -> Backoff {
        Backoff::new(self, StdRng::seed_from_u64(seed))
    }
}

/// Exponential backoff with uniform jitter.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    max_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    rng: StdRng,
}

impl Backoff {
    fn new(policy: &RetryPolicy, rng: StdRng) -> Self {
        Self {
            current: policy.initial_interval,
            max_interval: policy.max_interval,
            multiplier: policy.multiplier,
            randomization_factor: policy.randomization_factor,
            rng,
        }
    }

    /// The next wait.
    ///
    /// The un-jittered interval `i` grows by `multiplier` per call, capped at
    /// `max_interval`; the returned value is uniform in `[i(1-r), i(1+r)]`.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        self.current = Duration::try_from_secs_f64(interval.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval);

        if self.randomization_factor <= 0.0 || interval.is_zero() {
            return interval;
        }
        let secs = interval.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let jittered = self.rng.gen_range((secs - delta)..=(secs + delta));
        Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_interval())
    }
}

/// Receives envelopes whose retries are exhausted.
#[async_trait]
pub trait FailureHook: Send + Sync + 'static {
    /// Called once per exhausted envelope, before it is acknowledged.
    async fn on_failure(&self, failure: &Failure<'_>);
}

/// Details of an exhausted envelope.
#[derive(Debug)]
pub struct Failure<'a> {
    /// Topic the envelope came from.
    pub topic: &'a str,
    /// Handler that failed.
    pub handler: &'a str,
    /// The envelope.
    pub envelope: &'a Envelope,
    /// The last error.
    pub error: &'a HandlerError,
    /// Attempts made.
    pub attempts: u32,
}

/// Log the failure and drop the envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndDrop;

#[async_trait]
impl FailureHook for LogAndDrop {
    async fn on_failure(&self, failure: &Failure<'_>) {
        error!(
            topic = %failure.topic,
            handler = %failure.handler,
            id = %failure.envelope.id,
            attempts = failure.attempts,
            error = %failure.error,
            "Error handling message, dropping it"
        );
    }
}

/// Republish exhausted envelopes to `<prefix><topic>`.
pub struct DeadLetter {
    transport: Arc<dyn Transport>,
    prefix: String,
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetter")
            .field("transport", &self.transport.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl DeadLetter {
    /// Dead-letter into `transport` under the default prefix.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_prefix(transport, DEFAULT_DEAD_LETTER_PREFIX)
    }

    /// Dead-letter into `transport` under `prefix`.
    #[must_use]
    pub fn with_prefix(transport: Arc<dyn Transport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
        }
    }

    /// Topic an envelope from `topic` is dead-lettered to.
    #[must_use]
    pub fn topic_for(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }
}

#[async_trait]
impl FailureHook for DeadLetter {
    async fn on_failure(&self, failure: &Failure<'_>) {
        let target = self.topic_for(failure.topic);
        let envelope = failure
            .envelope
            .clone()
            .with_metadata(metadata::DEAD_LETTER_TOPIC, failure.topic)
            .with_metadata(metadata::DEAD_LETTER_REASON, failure.error.to_string())
            .with_metadata(metadata::DEAD_LETTER_ATTEMPTS, failure.attempts.to_string());

        match self.transport.publish(&target, envelope).await {
            Ok(()) => warn!(
                topic = %failure.topic,
                handler = %failure.handler,
                dead_letter = %target,
                attempts = failure.attempts,
                error = %failure.error,
                "Message dead-lettered"
            ),
            Err(e) => error!(
                topic = %failure.topic,
                dead_letter = %target,
                error = %e,
                "Failed to dead-letter message, dropping it"
            ),
        }
    }
}

/// Observer called before each retry with the retry number and the wait.
pub type OnRetry = Arc<dyn Fn(u32, Duration) + Send + Sync>;

/// Result of running a handler under a [`Retrier`].
#[derive(Debug)]
pub enum Outcome {
    /// A handler attempt succeeded.
    Succeeded {
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// All attempts failed and the failure hook ran.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        error: HandlerError,
    },
    /// Shutdown interrupted a backoff wait.
    Interrupted {
        /// Attempts made before the interruption.
        attempts: u32,
    },
}

/// Runs handler attempts under a [`RetryPolicy`].
pub struct Retrier {
    policy: RetryPolicy,
    hook: Arc<dyn FailureHook>,
    on_retry: Option<OnRetry>,
}

impl fmt::Debug for Retrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.is_some())
            .finish_non_exhaustive()
    }
}

impl Retrier {
    /// Create a retrier.
    #[must_use]
    pub fn new(policy: RetryPolicy, hook: Arc<dyn FailureHook>) -> Self {
        Self {
            policy,
            hook,
            on_retry: None,
        }
    }

    /// Observe retries.
    #[must_use]
    pub fn with_on_retry(mut self, on_retry: OnRetry) -> Self {
        self.on_retry = Some(on_retry);
        self
    }

    /// The policy in effect.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds or the policy gives up.
    ///
    /// `attempt` receives the 1-based attempt number. Panics inside an
    /// attempt are caught and treated as retryable failures. A change on
    /// `shutdown` cancels a pending backoff wait.
    pub async fn run<F, Fut>(
        &self,
        topic: &str,
        handler: &str,
        envelope: &Envelope,
        shutdown: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> Outcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        let started = Instant::now();
        let mut backoff = self.policy.backoff();
        let mut attempts = 0;

        let error = loop {
            attempts += 1;
            let result = AssertUnwindSafe(attempt(attempts))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

            let error = match result {
                Ok(()) => return Outcome::Succeeded { attempts },
                Err(error) => error,
            };

            if attempts > self.policy.max_retries {
                break error;
            }
            let wait = backoff.next_interval();
            if let Some(budget) = self.policy.max_elapsed_time {
                if started.elapsed().saturating_add(wait) > budget {
                    break error;
                }
            }

            warn!(
                topic = %topic,
                handler = %handler,
                retry_no = attempts,
                max_retries = self.policy.max_retries,
                wait_ms = wait.as_millis() as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %error,
                "Error occurred, retrying"
            );
            counter!("courier_bus_retries_total", "topic" => topic.to_string()).increment(1);
            if let Some(on_retry) = &self.on_retry {
                on_retry(attempts, wait);
            }

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return Outcome::Interrupted { attempts },
            }
        };

        self.hook
            .on_failure(&Failure {
                topic,
                handler,
                envelope,
                error: &error,
                attempts,
            })
            .await;
        Outcome::Failed { attempts, error }
    }
}
