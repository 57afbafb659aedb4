//! Endpoint: a tagged transport variant naming where a reference can connect.
//!
//! Only the `tcp` transport is bundled (see `pylon-server::transceiver`);
//! the tagged-enum shape leaves room for additional transports without
//! touching [`Reference`](crate::reference::Reference) or the stringified
//! grammar's parser.

use std::fmt;

use crate::error::PylonError;

/// A single transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Plain TCP.
    Tcp {
        /// Hostname or address literal.
        host: String,
        /// TCP port.
        port: u16,
        /// Connect timeout override, in milliseconds (`0` = use the
        /// communicator default).
        timeout_ms: u32,
    },
}

impl Endpoint {
    /// The transport tag used in the stringified form (`"tcp"`).
    #[must_use]
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
        }
    }
}

/// Which order a multi-endpoint reference's endpoints are tried in when a
/// connection needs to be established. Corresponds to `Default.EndpointSelection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointSelectionPolicy {
    /// Shuffle the endpoint list before each connection attempt, spreading
    /// load across a multi-endpoint reference. The default, matching the
    /// property's documented default.
    #[default]
    Random,
    /// Always try endpoints in the order the reference lists them.
    Ordered,
}

impl std::str::FromStr for EndpointSelectionPolicy {
    type Err = PylonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Random" => Ok(Self::Random),
            "Ordered" => Ok(Self::Ordered),
            other => Err(PylonError::ParseError(format!("unknown endpoint selection policy {other}"))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port, timeout_ms } => {
                write!(f, "tcp -h {host} -p {port}")?;
                if *timeout_ms > 0 {
                    write!(f, " -t {timeout_ms}")?;
                }
                Ok(())
            },
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = PylonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let transport = tokens.next().ok_or_else(|| PylonError::ParseError("empty endpoint".into()))?;

        match transport {
            "tcp" => {
                let mut host = None;
                let mut port = None;
                let mut timeout_ms = 0u32;
                while let Some(flag) = tokens.next() {
                    let value = tokens
                        .next()
                        .ok_or_else(|| PylonError::ParseError(format!("endpoint flag {flag} missing value")))?;
                    match flag {
                        "-h" => host = Some(value.to_string()),
                        "-p" => {
                            port = Some(value.parse::<u16>().map_err(|e| {
                                PylonError::ParseError(format!("invalid port {value}: {e}"))
                            })?);
                        },
                        "-t" => {
                            timeout_ms = value
                                .parse::<u32>()
                                .map_err(|e| PylonError::ParseError(format!("invalid timeout {value}: {e}")))?;
                        },
                        other => return Err(PylonError::ParseError(format!("unknown tcp endpoint flag {other}"))),
                    }
                }
                let host = host.ok_or_else(|| PylonError::ParseError("tcp endpoint missing -h".into()))?;
                let port = port.ok_or_else(|| PylonError::ParseError("tcp endpoint missing -p".into()))?;
                Ok(Self::Tcp { host, port, timeout_ms })
            },
            other => Err(PylonError::FeatureNotSupported(format!("transport {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_round_trips_through_string() {
        let ep = Endpoint::Tcp { host: "localhost".into(), port: 4061, timeout_ms: 0 };
        let s = ep.to_string();
        assert_eq!(s, "tcp -h localhost -p 4061");
        let parsed: Endpoint = s.parse().unwrap();
        assert_eq!(parsed, ep);
    }

    #[test]
    fn tcp_with_timeout_round_trips() {
        let ep = Endpoint::Tcp { host: "10.0.0.1".into(), port: 9999, timeout_ms: 5000 };
        let parsed: Endpoint = ep.to_string().parse().unwrap();
        assert_eq!(parsed, ep);
    }

    #[test]
    fn unsupported_transport_is_feature_not_supported() {
        let err = "quic -h localhost -p 4433".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, PylonError::FeatureNotSupported(_)));
    }

    #[test]
    fn missing_port_is_parse_error() {
        let err = "tcp -h localhost".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, PylonError::ParseError(_)));
    }

    #[test]
    fn endpoint_selection_policy_defaults_to_random() {
        assert_eq!(EndpointSelectionPolicy::default(), EndpointSelectionPolicy::Random);
    }

    #[test]
    fn endpoint_selection_policy_parses_known_values() {
        assert_eq!("Random".parse::<EndpointSelectionPolicy>().unwrap(), EndpointSelectionPolicy::Random);
        assert_eq!("Ordered".parse::<EndpointSelectionPolicy>().unwrap(), EndpointSelectionPolicy::Ordered);
        assert!("Weird".parse::<EndpointSelectionPolicy>().is_err());
    }
}
