//! Candidate identity and its wire codec
//!
//! A contender advertises itself by storing `"<host>:<port>"` as UTF-8 in its
//! contention node. No length prefix, no trailing delimiter.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{LeadershipError, Result};

/// The advertised network address of one master candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidateIdentity {
    host: String,
    port: u16,
}

impl CandidateIdentity {
    /// Create an identity, rejecting hosts that could not round-trip
    ///
    /// The host must be non-empty and contain neither `:` nor NUL.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        validate_host(&host, &host)?;
        Ok(Self { host, port })
    }

    /// The advertised host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The advertised port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Encode this identity as a node payload
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }
}

impl fmt::Display for CandidateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for CandidateIdentity {
    type Err = LeadershipError;

    fn from_str(s: &str) -> Result<Self> {
        decode(s.as_bytes())
    }
}

impl ToSocketAddrs for CandidateIdentity {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<Self::Iter> {
        (self.host.as_str(), self.port).to_socket_addrs()
    }
}

/// Encode an identity as the UTF-8 bytes of `"<host>:<port>"`
pub fn encode(identity: &CandidateIdentity) -> Vec<u8> {
    identity.to_string().into_bytes()
}

/// Decode a contention node payload
///
/// Splits on the first `:`. Fails with `MalformedAddress` when the payload is
/// not UTF-8, contains a NUL byte, lacks a host or port, or the port is not a
/// decimal number in `0..=65535`.
pub fn decode(bytes: &[u8]) -> Result<CandidateIdentity> {
    let lossy = || String::from_utf8_lossy(bytes).into_owned();

    if bytes.contains(&0) {
        return Err(LeadershipError::malformed(lossy(), "embedded null byte"));
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|e| LeadershipError::malformed(lossy(), format!("not UTF-8: {}", e)))?;

    let (host, port) = text
        .split_once(':')
        .ok_or_else(|| LeadershipError::malformed(text, "expected <host>:<port>"))?;

    validate_host(host, text)?;

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LeadershipError::malformed(text, "port is not a number"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| LeadershipError::malformed(text, "port out of range"))?;

    Ok(CandidateIdentity {
        host: host.to_string(),
        port,
    })
}

fn validate_host(host: &str, input: &str) -> Result<()> {
    if host.is_empty() {
        return Err(LeadershipError::malformed(input, "empty host"));
    }
    if host.contains(':') {
        return Err(LeadershipError::malformed(input, "host contains ':'"));
    }
    if host.contains('\0') {
        return Err(LeadershipError::malformed(input, "embedded null byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_encode_format() {
        let identity = CandidateIdentity::new("nimbus-a.example.com", 6627).unwrap();
        assert_eq!(encode(&identity), b"nimbus-a.example.com:6627".to_vec());
        assert_eq!(identity.to_string(), "nimbus-a.example.com:6627");
    }

    #[test]
    fn test_decode_valid() {
        let identity = decode(b"10.0.0.7:6627").unwrap();
        assert_eq!(identity.host(), "10.0.0.7");
        assert_eq!(identity.port(), 6627);
    }

    #[test]
    fn test_decode_port_zero() {
        let identity = decode(b"localhost:0").unwrap();
        assert_eq!(identity.port(), 0);
    }

    #[rstest]
    #[case::no_colon(b"nimbus".as_slice())]
    #[case::empty(b"".as_slice())]
    #[case::empty_host(b":6627".as_slice())]
    #[case::empty_port(b"nimbus:".as_slice())]
    #[case::negative_port(b"nimbus:-1".as_slice())]
    #[case::signed_port(b"nimbus:+1".as_slice())]
    #[case::port_out_of_range(b"nimbus:65536".as_slice())]
    #[case::extra_field(b"nimbus:6627:1".as_slice())]
    #[case::trailing_space(b"nimbus:6627 ".as_slice())]
    #[case::null_in_host(b"nim\0bus:6627".as_slice())]
    #[case::null_in_port(b"nimbus:66\x0027".as_slice())]
    #[case::invalid_utf8(b"nim\xffbus:6627".as_slice())]
    fn test_decode_rejects(#[case] input: &[u8]) {
        let result = decode(input);
        assert!(
            matches!(result, Err(LeadershipError::MalformedAddress { .. })),
            "expected MalformedAddress for {:?}, got {:?}",
            input,
            result
        );
    }

    #[rstest]
    #[case("")]
    #[case("fe80::1")]
    #[case("host\0")]
    fn test_new_rejects_unencodable_host(#[case] host: &str) {
        assert!(CandidateIdentity::new(host, 6627).is_err());
    }

    #[test]
    fn test_from_str() {
        let identity: CandidateIdentity = "B:6627".parse().unwrap();
        assert_eq!(identity, CandidateIdentity::new("B", 6627).unwrap());
    }

    #[test]
    fn test_to_socket_addrs_resolves_ip_literal() {
        let identity = CandidateIdentity::new("127.0.0.1", 6627).unwrap();
        let addrs: Vec<SocketAddr> = identity.to_socket_addrs().unwrap().collect();
        assert_eq!(addrs, vec!["127.0.0.1:6627".parse::<SocketAddr>().unwrap()]);
    }

    proptest! {
        #[test]
        fn prop_encode_decode_round_trip(host in "[a-zA-Z0-9.-]{1,64}", port in any::<u16>()) {
            let identity = CandidateIdentity::new(host, port).unwrap();
            prop_assert_eq!(decode(&encode(&identity)).unwrap(), identity);
        }
    }
}
