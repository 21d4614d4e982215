//! Configuration structures for clients and servers.

use std::time::Duration;

use crate::frame::MAX_CHANNELS;

/// Configuration for client peers and the supervisor.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Hosts the supervisor registers at construction. More can be
    /// added later with `add_host`.
    pub hosts: Vec<(String, u16)>,

    /// Deadline for a single connection attempt. Also the base delay of
    /// the supervisor's reconnect backoff, which doubles per failure and
    /// caps at ten times this value.
    pub connection_timeout: Duration,

    /// Per-connection cap on concurrent in-flight requests. Requests
    /// beyond the cap queue until a channel frees up. At most
    /// [`MAX_CHANNELS`].
    pub max_channels: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            connection_timeout: Duration::from_secs(5),
            max_channels: 128,
        }
    }
}

impl ClientConfig {
    /// Set the initial host list.
    pub fn with_hosts(mut self, hosts: Vec<(String, u16)>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the in-flight channel cap.
    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// Check the channel cap against the wire format's limit.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_channels == 0 || self.max_channels > MAX_CHANNELS {
            return Err(format!(
                "max_channels must be in 1..={}, got {}",
                MAX_CHANNELS, self.max_channels
            ));
        }
        Ok(())
    }
}

/// Configuration for the server side.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_address: String,

    /// Accept backlog depth passed to the listener.
    pub queue_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            queue_size: 5,
        }
    }
}

impl ServerConfig {
    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Set the accept backlog depth.
    pub fn with_queue_size(mut self, queue_size: u32) -> Self {
        self.queue_size = queue_size;
        self
    }
}
