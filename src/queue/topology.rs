//! Connection topology policy.
//!
//! Producer and consumer either each own a connection (`Dual`) or issue
//! commands on the same one (`Shared`). On a shared connection a blocking pop
//! occupies the connection until it returns: a push issued meanwhile is not
//! seen by that pop and only shows up on a later poll. The poll timeout must
//! therefore be bounded there, and short compared to the producer interval.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::config::ConfigError;
use crate::store::PollTimeout;

/// Smallest poll timeout derived for a shared connection.
const MIN_SHARED_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// How producer and consumer reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Topology {
    /// One connection per side; the consumer may block indefinitely.
    Dual,
    /// One connection for both sides; commands are serialized.
    Shared,
}

impl Topology {
    /// Roles played by the connections of this topology.
    pub fn roles(&self) -> &'static [ConnectionRole] {
        match self {
            Self::Dual => &[ConnectionRole::Producer, ConnectionRole::Consumer],
            Self::Shared => &[ConnectionRole::Shared],
        }
    }

    /// Number of connections this topology opens.
    pub fn connections(&self) -> usize {
        self.roles().len()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dual => "dual",
            Self::Shared => "shared",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dual" => Ok(Self::Dual),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown topology '{}'", other)),
        }
    }
}

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Producer,
    Consumer,
    Shared,
}

/// Result of checking a poll timeout against the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCheck {
    /// Pushes are never hidden behind a pending pop.
    Sound,
    /// A pending pop can outlast a producer interval on the shared
    /// connection: pushes will regularly surface one poll late.
    FalseMissesLikely,
}

/// Derives and validates blocking-pop timeouts for a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyPolicy {
    topology: Topology,
    strict: bool,
}

impl TopologyPolicy {
    /// Creates a lenient policy for `topology`.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            strict: false,
        }
    }

    /// In strict mode a shared poll timeout that is not shorter than the
    /// producer interval is rejected instead of logged.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Default poll timeout for this topology.
    ///
    /// A dual-connection consumer waits indefinitely; a shared-connection
    /// consumer waits half the producer interval.
    pub fn derive_poll_timeout(&self, producer_interval: Duration) -> PollTimeout {
        match self.topology {
            Topology::Dual => PollTimeout::Indefinite,
            Topology::Shared => {
                PollTimeout::Bounded((producer_interval / 2).max(MIN_SHARED_POLL_TIMEOUT))
            }
        }
    }

    /// Checks `poll_timeout` against the producer interval.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnboundedSharedPoll` for an indefinite timeout on a
    ///   shared connection
    /// - `ConfigError::SharedPollTooLong` in strict mode when the timeout is
    ///   not strictly shorter than the interval
    pub fn check(
        &self,
        poll_timeout: PollTimeout,
        producer_interval: Duration,
    ) -> Result<TimeoutCheck, ConfigError> {
        if self.topology == Topology::Dual {
            return Ok(TimeoutCheck::Sound);
        }

        let Some(timeout) = poll_timeout.duration() else {
            return Err(ConfigError::UnboundedSharedPoll(poll_timeout));
        };

        if timeout < producer_interval {
            return Ok(TimeoutCheck::Sound);
        }

        if self.strict {
            return Err(ConfigError::SharedPollTooLong {
                poll_timeout: timeout,
                interval: producer_interval,
            });
        }

        warn!(
            poll_timeout_ms = timeout.as_millis() as u64,
            interval_ms = producer_interval.as_millis() as u64,
            "Poll timeout reaches the producer interval on a shared connection; pushes will surface late"
        );
        Ok(TimeoutCheck::FalseMissesLikely)
    }

    /// Returns `requested`, or the derived default, once it passes [`check`](Self::check).
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`check`](Self::check).
    pub fn resolve(
        &self,
        requested: Option<PollTimeout>,
        producer_interval: Duration,
    ) -> Result<PollTimeout, ConfigError> {
        let timeout = requested.unwrap_or_else(|| self.derive_poll_timeout(producer_interval));
        self.check(timeout, producer_interval)?;
        Ok(timeout)
    }
}
