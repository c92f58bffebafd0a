//! Multinode endpoint URLs
//!
//! `jdbc:ojp[host1:port1(ds1),host2:port2]_postgresql://db/app` lists the
//! proxy nodes inside the brackets. Removing the `ojp[...]_` section leaves the
//! backend's own connection string, which is forwarded to the node unchanged.

use std::fmt;

use crate::error::ProxyError;
use crate::types::DatasourceName;

const MARKER: &str = "ojp[";
const CLOSE: &str = "]_";

/// One proxy node named in an endpoint URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub datasource: String,
}

impl Endpoint {
    /// `host:port`, the form used in cluster health reports
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn parse(entry: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidEndpoint(format!("'{entry}': {reason}"));

        let (address, datasource) = match entry.split_once('(') {
            Some((address, rest)) => {
                let name = rest
                    .strip_suffix(')')
                    .ok_or_else(|| invalid("unterminated datasource name"))?
                    .trim();
                if name.is_empty() {
                    return Err(invalid("empty datasource name"));
                }
                (address.trim(), name.to_string())
            }
            None => (entry, DatasourceName::DEFAULT.to_string()),
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid("port must be 1-65535"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            datasource,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.datasource == DatasourceName::DEFAULT {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}({})", self.host, self.port, self.datasource)
        }
    }
}

/// Parsed multinode endpoint URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    endpoints: Vec<Endpoint>,
    prefix: String,
    backend_url: String,
}

impl EndpointUrl {
    /// Parse a `...ojp[nodes]_...` URL
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` when the node section is missing or malformed, or
    /// names no node.
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let start = url
            .find(MARKER)
            .ok_or_else(|| ProxyError::InvalidEndpoint(format!("no '{MARKER}...{CLOSE}' section in '{url}'")))?;
        let inner_start = start + MARKER.len();
        let inner_len = url[inner_start..]
            .find(CLOSE)
            .ok_or_else(|| ProxyError::InvalidEndpoint(format!("unterminated node list in '{url}'")))?;
        let inner = &url[inner_start..inner_start + inner_len];

        let endpoints = inner
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Endpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ProxyError::InvalidEndpoint(format!("no nodes listed in '{url}'")));
        }

        let prefix = url[..start].to_string();
        let rest = &url[inner_start + inner_len + CLOSE.len()..];
        Ok(Self {
            endpoints,
            backend_url: format!("{prefix}{rest}"),
            prefix,
        })
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Connection string for the backend driver, node list removed
    #[must_use]
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// The same URL naming only `endpoint`
    #[must_use]
    pub fn with_single_endpoint(&self, endpoint: &Endpoint) -> String {
        let rest = &self.backend_url[self.prefix.len()..];
        format!("{}{MARKER}{endpoint}{CLOSE}{rest}", self.prefix)
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self.endpoints.iter().map(ToString::to_string).collect();
        let rest = &self.backend_url[self.prefix.len()..];
        write!(f, "{}{MARKER}{}{CLOSE}{rest}", self.prefix, nodes.join(","))
    }
}

impl std::str::FromStr for EndpointUrl {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
