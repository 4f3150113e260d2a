/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

/// Configuration as specified by the operator. Every sub-protocol round-trip in the
/// service is bounded by one of these deadlines.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Deadline for fetching a single block or chain update from a roster member.
    pub block_fetch_timeout: Duration,
    /// Deadline for one forward-link co-signing round.
    pub cosign_timeout: Duration,
    /// Deadline per candidate when querying new roster members for acceptance.
    pub extend_roster_timeout: Duration,
    /// Minimum time between two snapshot writes. Zero disables rate limiting.
    pub save_quiet_window: Duration,
    /// Sleep between polls of the network when no message is available.
    pub recv_poll_interval: Duration,
    /// Worker threads for message handlers that themselves wait on the network.
    pub handler_threads: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            block_fetch_timeout: Duration::from_millis(1000),
            cosign_timeout: Duration::from_secs(60),
            extend_roster_timeout: Duration::from_secs(1),
            save_quiet_window: Duration::from_secs(1),
            recv_poll_interval: Duration::from_millis(5),
            handler_threads: 4,
        }
    }
}
