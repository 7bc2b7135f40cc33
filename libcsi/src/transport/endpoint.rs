//! Listen/connect addresses.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CsiError;

/// Where a [`CsiServer`](super::CsiServer) listens or a
/// [`CsiClient`](super::CsiClient) connects.
///
/// Parsed from `unix://<path>` or `tcp://<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CsiError::InvalidArgument(format!("invalid endpoint {s:?}"));
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match scheme.to_ascii_lowercase().as_str() {
            "unix" => Ok(Self::Unix(PathBuf::from(rest))),
            "tcp" => {
                // host:port, the port being mandatory
                match rest.rsplit_once(':') {
                    Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                        Ok(Self::Tcp(rest.to_owned()))
                    }
                    _ => Err(invalid()),
                }
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_schemes() {
        assert_eq!(
            "unix:///tmp/csi.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/csi.sock"))
        );
        assert_eq!(
            "tcp://127.0.0.1:10000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:10000".into())
        );
        assert_eq!(
            "TCP://[::1]:9000".parse::<Endpoint>().unwrap().to_string(),
            "tcp://[::1]:9000"
        );
    }

    #[test]
    fn rejects_everything_else() {
        for bad in ["", "/tmp/csi.sock", "unix://", "http://x:1", "tcp://nohost", "tcp://:80", "tcp://h:port"] {
            let err = bad.parse::<Endpoint>().unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "{bad:?}");
        }
    }
}
