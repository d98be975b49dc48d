//! D-Bus transport address parsing.
//!
//! A D-Bus address is a semicolon-separated list of candidate entries of the
//! form `transport:key=value,key=value`. The engine only consumes the parsed
//! list; opening and authenticating a transport is the connector's job.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// One candidate entry from a D-Bus address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    transport: String,
    params: HashMap<String, String>,
}

impl AddressEntry {
    /// Parse a full address string into its ordered entries.
    ///
    /// Empty entries are skipped; an address with no usable entries is an
    /// error.
    pub fn parse_list(address: &str) -> Result<Vec<AddressEntry>> {
        let mut entries = Vec::new();
        for part in address.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            entries.push(Self::parse(part)?);
        }
        if entries.is_empty() {
            return Err(Error::InvalidArgument(
                "no addresses in D-Bus address string".to_string(),
            ));
        }
        Ok(entries)
    }

    /// Parse a single `transport:key=value,...` entry.
    pub fn parse(entry: &str) -> Result<AddressEntry> {
        let (transport, rest) = entry.split_once(':').ok_or_else(|| {
            Error::InvalidArgument(format!("address entry {entry:?} has no transport prefix"))
        })?;
        if transport.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "address entry {entry:?} has an empty transport"
            )));
        }

        let mut params = HashMap::new();
        for pair in rest.split(',') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidArgument(format!("malformed key=value pair {pair:?} in {entry:?}"))
            })?;
            params.insert(key.to_string(), value.to_string());
        }

        Ok(AddressEntry {
            transport: transport.to_string(),
            params,
        })
    }

    /// The transport kind, e.g. `unix` or `tcp`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Look up a transport parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|v| v.as_str())
    }

    /// The expected server GUID, if the entry carries one.
    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }
}
