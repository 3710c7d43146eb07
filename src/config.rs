use std::fs::File;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{Endpoint, IpAddr, Ipv4Addr, SocketAddr};
use crate::tcp::DEFAULT_MAX_CONNECTIONS;

pub const DEFAULT_SESSION_LIMIT: usize = 10_000;

/// Durations in config files are given in milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match dur {
                Some(dur) => s.serialize_some(&(dur.as_millis() as u64)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }

    /// A period driving a timer, which cannot be zero.
    pub mod interval {
        use super::*;
        use serde::de::Error;

        pub use super::serialize;

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
            match u64::deserialize(d)? {
                0 => Err(D::Error::custom("interval must be at least 1 ms")),
                ms => Ok(Duration::from_millis(ms)),
            }
        }

        pub mod option {
            use super::*;

            pub use super::super::option::serialize;

            pub fn deserialize<'de, D: Deserializer<'de>>(
                d: D,
            ) -> Result<Option<Duration>, D::Error> {
                match Option::<u64>::deserialize(d)? {
                    Some(0) => Err(D::Error::custom("interval must be at least 1 ms")),
                    ms => Ok(ms.map(Duration::from_millis)),
                }
            }
        }
    }
}

/// Settings of the half accepting SOCKS clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrontendConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub max_connections: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            listen_ip: Ipv4Addr::LOCALHOST.into(),
            listen_port: 1080,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl FrontendConfig {
    pub fn new(listen_ip: IpAddr, listen_port: u16) -> Self {
        Self {
            listen_ip,
            listen_port,
            ..Self::default()
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn listen_endpoint(&self) -> Endpoint {
        self.listen_addr().into()
    }

    pub fn set_max_connections(&mut self, max_connections: usize) -> &mut Self {
        self.max_connections = max_connections;
        self
    }
}

/// Settings of the half connecting to destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Connect to private, loopback and other non-unicast addresses.
    pub allow_non_unicast: bool,
    /// Concurrent sessions per user.
    pub session_limit: usize,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Global limit in bytes per second, shared fairly between sessions.
    pub bandwidth_limit: Option<u64>,
    #[serde(with = "millis::interval")]
    pub bandwidth_interval: Duration,
    /// SOCKS5 server to reach destinations through.
    pub reproxy: Option<Endpoint>,
    #[serde(with = "millis::interval::option")]
    pub snapshot_interval: Option<Duration>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            allow_non_unicast: false,
            session_limit: DEFAULT_SESSION_LIMIT,
            connect_timeout: Duration::from_secs(10),
            bandwidth_limit: None,
            bandwidth_interval: Duration::from_secs(5),
            reproxy: None,
            snapshot_interval: None,
        }
    }
}

impl BackendConfig {
    pub fn set_allow_non_unicast(&mut self, allow: bool) -> &mut Self {
        self.allow_non_unicast = allow;
        self
    }

    pub fn set_session_limit(&mut self, limit: usize) -> &mut Self {
        self.session_limit = limit;
        self
    }

    pub fn set_connect_timeout(&mut self, dur: Duration) -> &mut Self {
        self.connect_timeout = dur;
        self
    }

    pub fn set_bandwidth_limit(&mut self, limit: Option<u64>, interval: Duration) -> &mut Self {
        self.bandwidth_limit = limit;
        self.bandwidth_interval = interval;
        self
    }

    pub fn set_reproxy(&mut self, reproxy: Option<Endpoint>) -> &mut Self {
        self.reproxy = reproxy;
        self
    }

    pub fn set_snapshot_interval(&mut self, dur: Option<Duration>) -> &mut Self {
        self.snapshot_interval = dur;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub frontend: FrontendConfig,
    pub backend: BackendConfig,
}

impl Config {
    pub fn with_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}
