use std::{default::Default, time::Duration};

/// Configuration options to tune reactor and TCP behavior.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker event loops. 0 runs everything on the base loop.
    pub worker_threads: usize,
    /// How long one poll blocks when no descriptor is ready.
    pub poll_timeout: Duration,
    /// Delay before the first connect retry.
    pub connect_retry_initial: Duration,
    /// Upper bound for the doubling connect retry delay.
    pub connect_retry_max: Duration,
    /// Output-buffer size at which the high-water-mark callback fires.
    pub high_water_mark: usize,
    /// Set TCP_NODELAY on accepted and connected sockets.
    pub tcp_nodelay: bool,
    /// Set SO_REUSEADDR on listening sockets.
    pub reuse_addr: bool,
    /// Enable SO_KEEPALIVE on established connections.
    pub keepalive: bool,
    /// Listen backlog handed to the kernel.
    pub listen_backlog: i32,
    /// Socket receive buffer size in bytes (None = use system default).
    /// Corresponds to SO_RCVBUF.
    pub socket_recv_buffer_size: Option<usize>,
    /// Socket send buffer size in bytes (None = use system default).
    /// Corresponds to SO_SNDBUF.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            poll_timeout: Duration::from_secs(10),
            connect_retry_initial: Duration::from_millis(500),
            connect_retry_max: Duration::from_secs(30),
            high_water_mark: 64 * 1024 * 1024,
            tcp_nodelay: true,
            reuse_addr: true,
            keepalive: false,
            listen_backlog: 128,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.poll_timeout, Duration::from_secs(10));
        assert!(config.connect_retry_initial < config.connect_retry_max);
        assert_eq!(config.socket_recv_buffer_size, None);
        assert_eq!(config.socket_send_buffer_size, None);
    }
}
