//! Keep-alive heartbeat.
//!
//! Sends SSH_MSG_IGNORE at a fixed interval so idle sessions are not
//! dropped by the server or by middleboxes. The task ends on the first
//! send failure, which in practice means the session is gone.

use crate::ssh::message;
use rand::RngCore;
use skerry_platform::SkerryResult;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Random padding carried by each keep-alive message.
pub const KEEPALIVE_DATA_LEN: usize = 16;

/// Background keep-alive task. Stops when dropped.
pub struct KeepaliveTask {
    interval: Duration,
    handle: JoinHandle<()>,
}

impl KeepaliveTask {
    /// Spawns the task. `send` is called once per interval, starting one
    /// interval from now.
    pub fn spawn<F, Fut>(interval: Duration, send: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = SkerryResult<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            debug!("Keep-alive every {:?}", interval);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = send().await {
                    warn!("Keep-alive failed: {} - stopping", e);
                    break;
                }
            }
        });

        Self { interval, handle }
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops the task.
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Returns whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds an SSH_MSG_IGNORE payload with `data_len` random bytes.
pub fn create_keepalive_message(data_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    message::ignore(&data)
}
