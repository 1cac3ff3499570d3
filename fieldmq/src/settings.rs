use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::binding::FieldBinding;
use crate::error::EngineError;
use crate::Result;

/// The seam to the platform's configuration loader.
///
/// `load` is called at every pass through LoadConfig, including reloads.
pub trait ConfigSource: Send {
    fn load(&self) -> Result<Settings>;
}

/// Loads settings from a TOML file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSource { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Settings> {
        let raw = std::fs::read_to_string(&self.path)?;
        let settings: Settings = toml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Fixed in-memory settings, for embedding and tests.
pub struct StaticSource(pub Settings);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<Settings> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Broker address, `tcp://host:port` or `tls://host:port`.
    #[serde(deserialize_with = "Settings::deserialize_server")]
    pub server: ServerAddr,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "Settings::client_id_default")]
    pub client_id: String,

    /// Keepalive interval, seconds.
    #[serde(default = "Settings::keepalive_default")]
    pub keepalive: u16,
    /// Transport connect timeout, seconds.
    #[serde(default = "Settings::connect_timeout_default")]
    pub connect_timeout: u64,
    /// Max inbound packet size, bytes.
    #[serde(default = "Settings::max_packet_size_default")]
    pub max_packet_size: u32,

    /// Extra PEM root certificate file, added to the webpki roots.
    #[serde(default)]
    pub root_cert: Option<String>,
    /// Client certificate chain (PEM) for mutual TLS.
    #[serde(default)]
    pub client_cert: Option<String>,
    /// Client private key (PEM) for mutual TLS.
    #[serde(default)]
    pub client_key: Option<String>,

    #[serde(default)]
    pub bindings: Vec<FieldBinding>,
}

impl Settings {
    fn client_id_default() -> String {
        "fieldmq".into()
    }

    fn keepalive_default() -> u16 {
        60
    }

    fn connect_timeout_default() -> u64 {
        8
    }

    fn max_packet_size_default() -> u32 {
        1024 * 1024
    }

    #[inline]
    pub fn deserialize_server<'de, D>(deserializer: D) -> std::result::Result<ServerAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let addr = String::deserialize(deserializer)?;
        ServerAddr::parse(&addr).map_err(de::Error::custom)
    }

    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.client_id.is_empty() {
            return Err(EngineError::Config("client_id must not be empty".into()));
        }
        if self.keepalive == 0 {
            return Err(EngineError::Config("keepalive must be at least 1 second".into()));
        }
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err(EngineError::Config("client_cert and client_key must be set together".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum AddrType {
    Tcp,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub typ: AddrType,
    pub addr: String,
}

impl ServerAddr {
    pub fn parse(addr: &str) -> std::result::Result<Self, EngineError> {
        let (typ, rest) = match addr.split_once("://") {
            None => (AddrType::Tcp, addr),
            Some(("tcp", rest)) => (AddrType::Tcp, rest),
            Some(("tls", rest)) => (AddrType::Tls, rest),
            Some((scheme, _)) => {
                return Err(EngineError::Config(format!("unsupported scheme {scheme:?} in {addr:?}")))
            }
        };
        // bracketed IPv6 literals keep their brackets in `addr` (the socket
        // address form) but not in `host()`
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => bracketed.split_once("]:").ok_or_else(|| {
                EngineError::Config(format!("invalid IPv6 server address {addr:?}"))
            })?,
            None => rest.rsplit_once(':').ok_or_else(|| {
                EngineError::Config(format!("server address {addr:?} is missing a port"))
            })?,
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(EngineError::Config(format!("invalid server address {addr:?}")));
        }
        Ok(ServerAddr { typ, addr: rest.into() })
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.typ == AddrType::Tls
    }

    /// Host part, for TLS server-name verification. Brackets around an IPv6
    /// literal are stripped.
    #[inline]
    pub fn host(&self) -> &str {
        match self.addr.strip_prefix('[') {
            Some(rest) => rest.split_once(']').map(|(host, _)| host).unwrap_or(rest),
            None => self.addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(&self.addr),
        }
    }
}

impl Serialize for ServerAddr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let scheme = match self.typ {
            AddrType::Tcp => "tcp",
            AddrType::Tls => "tls",
        };
        format!("{scheme}://{}", self.addr).serialize(serializer)
    }
}
