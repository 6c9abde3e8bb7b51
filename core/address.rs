// Connection address strings: "method:key=value,key=value;method:..."
use crate::error::AddressError;
use crate::types::Guid;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One `;`-separated entry of an address string, with values unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    method: String,
    params: BTreeMap<String, String>,
}

impl AddressEntry {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.method)?;
        let pairs: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape_value(v)))
            .collect();
        f.write_str(&pairs.join(","))
    }
}

/// Characters that never need escaping in an address value.
fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'\\' | b'.' | b'*')
}

pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if is_optionally_escaped(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode([b]));
        }
    }
    out
}

pub fn unescape_value(value: &str) -> Result<String, AddressError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let digits = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| AddressError::BadEscape(value.to_string()))?;
                let mut decoded = [0u8; 1];
                hex::decode_to_slice(digits, &mut decoded)
                    .map_err(|_| AddressError::BadEscape(value.to_string()))?;
                out.push(decoded[0]);
                i += 3;
            }
            b if is_optionally_escaped(b) => {
                out.push(b);
                i += 1;
            }
            _ => return Err(AddressError::BadEscape(value.to_string())),
        }
    }
    String::from_utf8(out).map_err(|_| AddressError::BadEscape(value.to_string()))
}

/// Splits an address string into its entries.
pub fn parse_address(address: &str) -> Result<Vec<AddressEntry>, AddressError> {
    let mut entries = Vec::new();

    for raw in address.split(';').filter(|s| !s.is_empty()) {
        let (method, rest) = raw
            .split_once(':')
            .ok_or_else(|| AddressError::MissingMethod(raw.to_string()))?;
        if method.is_empty() {
            return Err(AddressError::MissingMethod(raw.to_string()));
        }

        let mut params = BTreeMap::new();
        for pair in rest.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| AddressError::MalformedPair(pair.to_string()))?;
            if key.is_empty() || value.is_empty() {
                return Err(AddressError::MalformedPair(pair.to_string()));
            }
            if params.insert(key.to_string(), unescape_value(value)?).is_some() {
                return Err(AddressError::DuplicateKey(key.to_string()));
            }
        }

        entries.push(AddressEntry {
            method: method.to_string(),
            params,
        });
    }

    if entries.is_empty() {
        return Err(AddressError::Empty);
    }
    Ok(entries)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFamily {
    Ipv4,
    Ipv6,
}

/// A resolved connect/listen target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketTarget {
    UnixPath(PathBuf),
    /// Linux abstract namespace name, without the leading NUL.
    UnixAbstract(String),
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    NonceTcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
        noncefile: Option<PathBuf>,
    },
}

/// An address entry turned into something a transport can be opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAddress {
    pub target: SocketTarget,
    pub expected_guid: Option<Guid>,
    /// The entry this was resolved from, kept for diagnostics.
    pub entry: String,
}

impl TransportAddress {
    pub fn from_entry(entry: &AddressEntry) -> Result<Self, AddressError> {
        let method = entry.method().to_string();
        let expected_guid = entry.get("guid").map(str::parse::<Guid>).transpose()?;

        let target = match entry.method() {
            "unix" => match (entry.get("path"), entry.get("abstract")) {
                (Some(_), Some(_)) => {
                    return Err(AddressError::ConflictingKeys {
                        method,
                        first: "path",
                        second: "abstract",
                    })
                }
                (Some(path), None) => SocketTarget::UnixPath(PathBuf::from(path)),
                (None, Some(name)) => SocketTarget::UnixAbstract(name.to_string()),
                (None, None) => {
                    return Err(AddressError::MissingKey { method, key: "path" });
                }
            },
            "tcp" | "nonce-tcp" => {
                let host = entry.get("host").unwrap_or("localhost").to_string();
                let port = match entry.get("port") {
                    Some(p) => p.parse::<u16>().map_err(|_| AddressError::BadPort(p.to_string()))?,
                    None => return Err(AddressError::MissingKey { method, key: "port" }),
                };
                let family = match entry.get("family") {
                    None => None,
                    Some("ipv4") => Some(TcpFamily::Ipv4),
                    Some("ipv6") => Some(TcpFamily::Ipv6),
                    Some(other) => return Err(AddressError::BadFamily(other.to_string())),
                };
                if entry.method() == "tcp" {
                    SocketTarget::Tcp { host, port, family }
                } else {
                    SocketTarget::NonceTcp {
                        host,
                        port,
                        family,
                        noncefile: entry.get("noncefile").map(PathBuf::from),
                    }
                }
            }
            other => return Err(AddressError::UnsupportedMethod(other.to_string())),
        };

        Ok(TransportAddress {
            target,
            expected_guid,
            entry: entry.to_string(),
        })
    }

    /// Resolves every entry of an address string, in order.
    pub fn parse_all(address: &str) -> Result<Vec<TransportAddress>, AddressError> {
        parse_address(address)?.iter().map(Self::from_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_entries() {
        let entries = parse_address("unix:path=/tmp/bus;tcp:host=127.0.0.1,port=4000").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].method(), "unix");
        assert_eq!(entries[0].get("path"), Some("/tmp/bus"));
        assert_eq!(entries[1].get("port"), Some("4000"));
    }

    #[test]
    fn unescapes_values() {
        let entries = parse_address("unix:path=/tmp/with%20space").unwrap();
        assert_eq!(entries[0].get("path"), Some("/tmp/with space"));
        assert_eq!(escape_value("/tmp/with space"), "/tmp/with%20space");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_address(""), Err(AddressError::Empty));
        assert!(matches!(parse_address("nocolon"), Err(AddressError::MissingMethod(_))));
        assert!(matches!(parse_address("unix:path"), Err(AddressError::MalformedPair(_))));
        assert!(matches!(
            parse_address("unix:path=/a,path=/b"),
            Err(AddressError::DuplicateKey(_))
        ));
        assert!(matches!(parse_address("unix:path=%zz"), Err(AddressError::BadEscape(_))));
        assert!(matches!(parse_address("unix:path=a b"), Err(AddressError::BadEscape(_))));
    }

    #[test]
    fn resolves_targets_and_guid() {
        let guid = Guid::generate();
        let text = format!("unix:abstract=busline-test,guid={guid}");
        let addrs = TransportAddress::parse_all(&text).unwrap();
        assert_eq!(addrs[0].target, SocketTarget::UnixAbstract("busline-test".into()));
        assert_eq!(addrs[0].expected_guid, Some(guid));

        let addrs = TransportAddress::parse_all("nonce-tcp:port=55,noncefile=/tmp/n,family=ipv4").unwrap();
        assert_eq!(
            addrs[0].target,
            SocketTarget::NonceTcp {
                host: "localhost".into(),
                port: 55,
                family: Some(TcpFamily::Ipv4),
                noncefile: Some(PathBuf::from("/tmp/n")),
            }
        );
    }

    #[test]
    fn resolution_errors() {
        assert!(matches!(
            TransportAddress::parse_all("unix:path=/a,abstract=b"),
            Err(AddressError::ConflictingKeys { .. })
        ));
        assert!(matches!(
            TransportAddress::parse_all("tcp:host=x"),
            Err(AddressError::MissingKey { key: "port", .. })
        ));
        assert!(matches!(
            TransportAddress::parse_all("tcp:port=99999"),
            Err(AddressError::BadPort(_))
        ));
        assert!(matches!(
            TransportAddress::parse_all("launchd:env=X"),
            Err(AddressError::UnsupportedMethod(_))
        ));
        assert!(matches!(
            TransportAddress::parse_all("unix:path=/a,guid=1234"),
            Err(AddressError::Guid(_))
        ));
    }
}
