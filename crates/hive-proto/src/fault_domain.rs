//! Fault-domain topology paths.
//!
//! A fault domain is a slash-separated path from the root of the cluster
//! topology down to a host, e.g. `/rack0/host3`. The membership authority
//! uses it to avoid placing redundant data inside a single failure unit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CtlError;

const SEPARATOR: char = '/';

/// A parsed fault-domain path. The empty path is the topology root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultDomain {
    domains: Vec<String>,
}

impl FaultDomain {
    /// The topology root, rendered as `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a fault domain from its path components, top level first.
    pub fn new<I, S>(domains: I) -> Result<Self, CtlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for d in domains {
            let d: String = d.into();
            let trimmed = d.trim();
            if trimmed.is_empty() || trimmed.contains(SEPARATOR) {
                return Err(CtlError::InvalidFaultDomain(d));
            }
            out.push(trimmed.to_string());
        }
        Ok(Self { domains: out })
    }

    pub fn is_root(&self) -> bool {
        self.domains.is_empty()
    }

    /// Number of levels below the root.
    pub fn depth(&self) -> usize {
        self.domains.len()
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

impl FromStr for FaultDomain {
    type Err = CtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = trimmed.strip_prefix(SEPARATOR) else {
            return Err(CtlError::InvalidFaultDomain(s.to_string()));
        };
        let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);
        Self::new(rest.split(SEPARATOR)).map_err(|_| CtlError::InvalidFaultDomain(s.to_string()))
    }
}

impl fmt::Display for FaultDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domains.is_empty() {
            return f.write_str("/");
        }
        for d in &self.domains {
            write!(f, "/{}", d)?;
        }
        Ok(())
    }
}
