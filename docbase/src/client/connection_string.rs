//! Connection string parsing.

use crate::cluster::config::{DEFAULT_KV_PORT, DEFAULT_KV_TLS_PORT};
use crate::cluster::node::Endpoint;
use crate::errors::ConnectionStringError;

/// Scheme of a connection string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain connections.
    Couchbase,
    /// TLS connections.
    Couchbases,
}

/// A parsed connection string: a scheme and a seed host list.
///
/// Recognized forms:
///
/// ```text
/// couchbase://10.0.0.1
/// couchbases://db1.example.com,db2.example.com:11207
/// 10.0.0.1,10.0.0.2
/// couchbase://user@cluster.example.com?opt=ignored
/// ```
///
/// Query parameters and paths are ignored; unrecognized options are not an
/// error. A single hostname without an explicit port is a DNS-SRV candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    scheme: Scheme,
    hosts: Vec<(String, Option<u16>)>,
}

impl ConnectionString {
    /// Parses `input`. Fails when no endpoint can be derived from it.
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let (scheme, rest) = match input.split_once("://") {
            Some(("couchbase", rest)) => (Scheme::Couchbase, rest),
            Some(("couchbases", rest)) => (Scheme::Couchbases, rest),
            Some((other, _)) => {
                return Err(ConnectionStringError::UnsupportedScheme(other.to_owned()))
            }
            None => (Scheme::Couchbase, input),
        };

        // Options and paths are parsed elsewhere (and unknown ones ignored);
        // only the authority matters here.
        let rest = rest.split(['?', '/']).next().unwrap_or_default();
        let rest = rest.rsplit_once('@').map_or(rest, |(_, hosts)| hosts);

        let mut hosts = Vec::new();
        for entry in rest.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| ConnectionStringError::InvalidPort(entry.to_owned()))?;
                    hosts.push((host.to_owned(), Some(port)));
                }
                None => hosts.push((entry.to_owned(), None)),
            }
        }

        if hosts.is_empty() {
            return Err(ConnectionStringError::NoEndpoints);
        }
        Ok(ConnectionString { scheme, hosts })
    }

    /// Whether the scheme asks for TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Couchbases
    }

    /// The literal seed endpoints, with scheme-appropriate default ports.
    pub fn endpoints(&self, tls: bool) -> Vec<Endpoint> {
        let default_port = if tls {
            DEFAULT_KV_TLS_PORT
        } else {
            DEFAULT_KV_PORT
        };
        self.hosts
            .iter()
            .map(|(host, port)| Endpoint::new(host.clone(), port.unwrap_or(default_port), tls))
            .collect()
    }

    /// The hostname to try DNS-SRV against: a single non-literal host with
    /// no explicit port.
    pub fn srv_candidate(&self) -> Option<&str> {
        match self.hosts.as_slice() {
            [(host, None)] if host.parse::<std::net::IpAddr>().is_err() => Some(host),
            _ => None,
        }
    }
}
