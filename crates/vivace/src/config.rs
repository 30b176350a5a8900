use serde::Deserialize;

use crate::error::{Error, Result};

/// Project-level settings. The TOML/.env loaders live outside the core; they
/// only need these structs to be deserializable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project_name: String,
    /// Root served by the `/public/` short-circuit.
    pub public_dir: String,
    /// Input tree walked by the template precompiler.
    pub template_dir: String,
    /// Ordered names consumed when materializing the global middleware stack.
    pub middleware_list: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_name: "vivace-app".to_string(),
            public_dir: "public".to_string(),
            template_dir: "templates".to_string(),
            middleware_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub send_buffer_max: u32,
    pub recv_buffer_max: u32,
    pub recv_buffer_incr: u32,

    /// Seconds from first byte until the header terminator must arrive.
    pub header_timeout: u16,
    /// Seconds allowed for the remainder of a Content-Length body.
    pub body_timeout: u16,
    /// Keep-alive idle seconds between requests.
    pub idle_timeout: u16,

    pub header_reserve_hint: u16,
    pub max_header_size: u32,
    pub max_header_count: u32,
    pub max_body_size: u32,

    pub max_connections: u64,
    pub max_connections_per_ip: u32,
    pub max_request_burst_per_ip: u32,
    pub max_requests_per_ip_per_sec: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            send_buffer_max: 2 * 1024,
            recv_buffer_max: 16 * 1024,
            recv_buffer_incr: 4 * 1024,
            header_timeout: 15,
            body_timeout: 20,
            idle_timeout: 60,
            header_reserve_hint: 512,
            max_header_size: 8 * 1024,
            max_header_count: 64,
            max_body_size: 8 * 1024,
            max_connections: 10_000,
            max_connections_per_ip: 20,
            max_request_burst_per_ip: 10,
            max_requests_per_ip_per_sec: 5,
        }
    }
}

/// Knobs consumed only by the POSIX reactor backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OsConfig {
    pub worker_processes: u32,
    pub accept_slots: u16,
    pub batch_size: u16,
    pub backlog: u32,
    pub queue_depth: u32,
    pub file_chunk_size: u32,
    pub file_cache_size: u16,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            worker_processes: 4,
            accept_slots: 64,
            batch_size: 64,
            backlog: 1024,
            queue_depth: 4096,
            file_chunk_size: 64 * 1024,
            file_cache_size: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project: ProjectConfig,
    pub network: NetworkConfig,
    pub os: OsConfig,
}

impl Config {
    /// Reject value combinations the parser cannot honor.
    pub fn validate(&self) -> Result<()> {
        let net = &self.network;

        if net.recv_buffer_max < net.max_header_size {
            return Err(Error::Config(format!(
                "recv_buffer_max ({}) must be at least max_header_size ({})",
                net.recv_buffer_max, net.max_header_size
            )));
        }
        if net.recv_buffer_incr == 0 || net.recv_buffer_incr > net.recv_buffer_max {
            return Err(Error::Config(format!(
                "recv_buffer_incr ({}) must be in 1..=recv_buffer_max ({})",
                net.recv_buffer_incr, net.recv_buffer_max
            )));
        }
        if net.max_connections == 0 {
            return Err(Error::Config("max_connections must be non-zero".to_string()));
        }
        if net.max_request_burst_per_ip == 0 {
            return Err(Error::Config(
                "max_request_burst_per_ip must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_recv_buffer_smaller_than_headers() {
        let mut cfg = Config::default();
        cfg.network.recv_buffer_max = 1024;
        cfg.network.max_header_size = 8 * 1024;
        assert!(cfg.validate().is_err());
    }
}
