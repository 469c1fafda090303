//! Reconnecting depth-diff feed for one symbol
//!
//! Reads `<symbol>@depth` frames and pushes them into a book's depth sink.
//! Dropping the sink on exit is how the book learns the stream ended.

use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::WebSocketClient;
use crate::error::{ConnectorError, Result};
use crate::exchange::DepthSink;
use crate::parser::ParsedMessage;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Silence after which a keepalive ping is sent
const RECV_TIMEOUT_SECS: u64 = 45;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Base delay, doubled per attempt up to 2^6
    pub reconnect_delay_ms: u64,
    /// Consecutive failures before the stream gives up
    pub max_reconnect_attempts: u32,
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_delay = self
            .reconnect_delay_ms
            .saturating_mul(2u64.pow(attempt.min(6)));
        Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Depth feed with automatic reconnection
pub struct DepthStream {
    client: WebSocketClient,
    sink: DepthSink,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl DepthStream {
    /// `client` should already be connected
    pub fn new(
        client: WebSocketClient,
        sink: DepthSink,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let last_successful_connection = client.is_connected().then(Instant::now);
        Self {
            client,
            sink,
            policy,
            cancel,
            reconnect_attempts: 0,
            last_successful_connection,
        }
    }

    /// Run until cancelled, the consumer goes away or reconnects are exhausted
    pub async fn run(mut self) {
        let symbol = self.sink.symbol().to_string();
        let cancel = self.cancel.clone();
        info!(symbol = %symbol, url = %self.client.url(), "Depth stream started");

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.process() => result,
            };

            match result {
                Ok(()) => {
                    debug!(symbol = %symbol, "Depth consumer gone, stopping stream");
                    break;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Depth stream interrupted");
                    self.sink.report(&e);
                }
            }

            if !self.reconnect().await {
                break;
            }
        }

        self.client.close().await;
        info!(symbol = %symbol, "Depth stream stopped");
        // `self.sink` drops here
    }

    /// Returns false when the stream should stop
    async fn reconnect(&mut self) -> bool {
        // Reset reconnect attempts if we've been stable for a while
        if let Some(last_success) = self.last_successful_connection {
            if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                && self.reconnect_attempts > 0
            {
                info!(
                    previous_attempts = self.reconnect_attempts,
                    "Resetting reconnect counter after cooldown period"
                );
                self.reconnect_attempts = 0;
            }
        }

        loop {
            self.reconnect_attempts += 1;
            if self.reconnect_attempts > self.policy.max_reconnect_attempts {
                error!(
                    symbol = %self.sink.symbol(),
                    attempts = self.reconnect_attempts - 1,
                    "Depth stream reconnect attempts exhausted"
                );
                return false;
            }

            let delay = self.policy.backoff(self.reconnect_attempts);
            warn!(
                symbol = %self.sink.symbol(),
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting depth stream"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = sleep(delay) => {}
            }

            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                result = self.client.connect() => result,
            };

            match connected {
                Ok(()) => {
                    self.last_successful_connection = Some(Instant::now());
                    return true;
                }
                Err(e) => {
                    warn!(symbol = %self.sink.symbol(), error = %e, "Depth stream reconnect failed");
                    if !self.sink.report(&e) {
                        return false;
                    }
                }
            }
        }
    }

    /// Forward frames until an error. `Ok(())` means the consumer is gone.
    async fn process(&mut self) -> Result<()> {
        let recv_timeout = Duration::from_secs(RECV_TIMEOUT_SECS);

        loop {
            match timeout(recv_timeout, self.client.recv()).await {
                Ok(Ok(Some(text))) => match ParsedMessage::parse(&text) {
                    Ok(ParsedMessage::DepthUpdate(event)) => {
                        if !self.sink.push(event) {
                            return Ok(());
                        }
                    }
                    Ok(ParsedMessage::Unknown(msg)) => {
                        trace!(msg = %msg, "Unknown message type");
                    }
                    Err(e) => {
                        let error = ConnectorError::from(e);
                        warn!(symbol = %self.sink.symbol(), error = %error, "Failed to parse depth frame");
                        if !self.sink.report(&error) {
                            return Ok(());
                        }
                    }
                },
                Ok(Ok(None)) => {
                    if self.sink.is_closed() {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    // Quiet market is not a failure; ping the connection
                    debug!(symbol = %self.sink.symbol(), "No message within timeout, sending keepalive");
                    if let Err(e) = self.client.ping().await {
                        return Err(ConnectorError::Transport(format!(
                            "keepalive ping failed: {}",
                            e
                        )));
                    }
                }
            }
        }
    }
}
