#[cfg(test)]
mod candidate_test;

pub mod candidate_host;
pub mod candidate_multicast;
pub mod candidate_pair;
pub mod candidate_related;

use crc::{CRC_32_ISCSI, Crc};
use serde::{Deserialize, Serialize};
use shared::TransportProtocol;
use shared::error::*;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;
pub(crate) const MAX_PRIORITY: u32 = (1 << 31) - 1;

/// Indicates that the candidate is used for RTP.
pub const COMPONENT_RTP: u16 = 1;
/// Indicates that the candidate is used for RTCP.
pub const COMPONENT_RTCP: u16 = 2;

/// Represents the type of candidate `CandidateType` enum.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[default]
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
    #[serde(rename = "multicast")]
    Multicast,
}

// String makes CandidateType printable
impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Multicast => "multicast",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            "multicast" => Ok(CandidateType::Multicast),
            _ => Err(Error::ErrUnknownCandidateType(s.to_owned())),
        }
    }
}

impl CandidateType {
    /// Returns the preference weight of a `CandidateType`.
    ///
    /// 4.1.2.2.  Guidelines for Choosing Type and Local Preferences
    /// The RECOMMENDED values are 126 for host candidates, 100
    /// for server reflexive candidates, 110 for peer reflexive candidates,
    /// and 0 for relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | Self::Multicast => 0,
        }
    }

    /// Whether candidates of this type must carry the address they were derived from.
    pub const fn requires_base(self) -> bool {
        matches!(
            self,
            Self::ServerReflexive | Self::PeerReflexive | Self::Relay
        )
    }
}

/// Fields shared by every candidate constructor.
#[derive(Default, Debug, Clone)]
pub struct CandidateConfig {
    /// Derived from type, address and protocol when empty.
    pub foundation: String,
    pub component: u16,
    pub transport_protocol: TransportProtocol,
    pub address: String,
    pub port: u16,
    /// Computed from the type preference when zero.
    pub priority: u32,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CandidateConfig {
    pub(crate) fn into_candidate(
        self,
        candidate_type: CandidateType,
        base: Option<(String, u16)>,
        ttl: Option<u8>,
    ) -> Result<Candidate> {
        let (base_address, base_port) = match base {
            Some((address, port)) => (Some(address), Some(port)),
            None => (None, None),
        };

        let mut c = Candidate {
            foundation: self.foundation,
            component: self.component,
            candidate_type,
            transport_protocol: self.transport_protocol,
            address: self.address,
            port: self.port,
            base_address,
            base_port,
            priority: self.priority,
            ttl,
            username: self.username,
            password: self.password,
        };

        if c.foundation.is_empty() {
            c.foundation = c.compute_foundation();
        }
        if c.priority == 0 {
            c.priority = c.compute_priority();
        }

        c.validate()?;
        Ok(c)
    }
}

/// One transport endpoint option for one component of a stream.
///
/// A candidate is immutable once built. Two comparisons are available:
/// `==` compares every field, [`Candidate::are_equal`] only the transport
/// address.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub(crate) foundation: String,
    pub(crate) component: u16,
    #[serde(rename = "type")]
    pub(crate) candidate_type: CandidateType,
    #[serde(rename = "protocol")]
    pub(crate) transport_protocol: TransportProtocol,
    pub(crate) address: String,
    pub(crate) port: u16,
    #[serde(
        default,
        rename = "relatedAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) base_address: Option<String>,
    #[serde(default, rename = "relatedPort", skip_serializing_if = "Option::is_none")]
    pub(crate) base_port: Option<u16>,
    pub(crate) priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ttl: Option<u8>,
    #[serde(
        default,
        rename = "usernameFragment",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) password: Option<String>,
}

// String makes the Candidate printable
impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{}",
            self.transport_protocol, self.candidate_type, self.address, self.port
        )?;
        if let (Some(address), Some(port)) = (&self.base_address, self.base_port) {
            write!(f, " related {address}:{port}")?;
        }
        Ok(())
    }
}

impl Candidate {
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Returns candidate component.
    pub fn component(&self) -> u16 {
        self.component
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn transport_protocol(&self) -> TransportProtocol {
        self.transport_protocol
    }

    /// Returns Candidate Address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns Candidate Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address this candidate was derived from, if any.
    pub fn base_address(&self) -> Option<&str> {
        self.base_address.as_deref()
    }

    pub fn base_port(&self) -> Option<u16> {
        self.base_port
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Multicast time-to-live, only present on multicast candidates.
    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Parses the candidate address as an IP address.
    pub fn ip(&self) -> Result<IpAddr> {
        Ok(self.address.parse()?)
    }

    /// Parses the candidate address and port as a socket address.
    pub fn addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip()?, self.port))
    }

    /// Transport address equality: the address (ignoring case) and port match.
    /// Other fields, including the component, are not compared.
    pub fn are_equal(&self, other: &Candidate) -> bool {
        self.address.eq_ignore_ascii_case(&other.address) && self.port == other.port
    }

    /// Checks the field invariants of a candidate, typically one received
    /// from the signaling channel.
    pub fn validate(&self) -> Result<()> {
        if self.component == 0 {
            return Err(Error::ErrInvalidComponent(0));
        }
        if !is_token(&self.foundation) {
            return Err(Error::ErrInvalidCandidate(format!(
                "invalid foundation {:?}",
                self.foundation
            )));
        }
        if !is_token(&self.address) {
            return Err(Error::ErrInvalidCandidate(format!(
                "invalid address {:?}",
                self.address
            )));
        }
        if self.priority > MAX_PRIORITY {
            return Err(Error::ErrInvalidCandidate(format!(
                "priority {} exceeds {MAX_PRIORITY}",
                self.priority
            )));
        }

        match (&self.base_address, self.base_port) {
            (Some(address), Some(_)) => {
                if !is_token(address) {
                    return Err(Error::ErrInvalidCandidate(format!(
                        "invalid base address {address:?}"
                    )));
                }
                if self.candidate_type == CandidateType::Host {
                    return Err(Error::ErrInvalidCandidate(
                        "host candidates can't have a base address".to_owned(),
                    ));
                }
            }
            (None, None) => {
                if self.candidate_type.requires_base() {
                    return Err(Error::ErrInvalidCandidate(format!(
                        "{} candidates need a base address",
                        self.candidate_type
                    )));
                }
            }
            _ => return Err(Error::ErrParseRelatedAddr),
        }

        match (self.candidate_type, self.ttl) {
            (CandidateType::Multicast, None | Some(0)) => return Err(Error::ErrInvalidTtl),
            (CandidateType::Multicast, Some(_)) | (_, None) => {}
            (candidate_type, Some(_)) => {
                return Err(Error::ErrInvalidCandidate(format!(
                    "{candidate_type} candidates can't have a ttl"
                )));
            }
        }

        for credential in [&self.username, &self.password].into_iter().flatten() {
            if !is_token(credential) {
                return Err(Error::ErrInvalidCandidate(format!(
                    "invalid credential {credential:?}"
                )));
            }
        }

        Ok(())
    }

    /// Serializes the candidate as one ICE style candidate line.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport_protocol,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );

        if let (Some(address), Some(port)) = (&self.base_address, self.base_port) {
            val += format!(" raddr {address} rport {port}").as_str();
        }
        if let Some(ttl) = self.ttl {
            val += format!(" ttl {ttl}").as_str();
        }
        if let Some(username) = &self.username {
            val += format!(" ufrag {username}").as_str();
        }
        if let Some(password) = &self.password {
            val += format!(" pwd {password}").as_str();
        }

        val
    }

    fn compute_foundation(&self) -> String {
        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type.to_string().as_bytes());
        buf.extend_from_slice(self.address.as_bytes());
        buf.extend_from_slice(self.transport_protocol.to_string().as_bytes());

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);

        format!("{checksum}")
    }

    fn compute_priority(&self) -> u32 {
        (1 << 24) * u32::from(self.candidate_type.preference())
            + (1 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
            + 256u32.saturating_sub(u32::from(self.component))
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

/// Parses one candidate line produced by [`Candidate::marshal`].
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::ErrAttributeTooShortCandidate(split.len()));
    }

    if split[6] != "typ" {
        return Err(Error::ErrInvalidCandidate(format!(
            "expected typ, found {}",
            split[6]
        )));
    }

    let mut c = Candidate {
        foundation: split[0].to_owned(),
        component: split[1].parse()?,
        transport_protocol: split[2].parse()?,
        priority: split[3].parse()?,
        address: split[4].to_owned(),
        port: split[5].parse()?,
        candidate_type: split[7].parse()?,
        ..Default::default()
    };

    for pair in split[8..].chunks(2) {
        let [key, value] = pair else {
            return Err(Error::ErrInvalidCandidate(format!(
                "missing value for {}",
                pair[0]
            )));
        };
        match *key {
            "raddr" => c.base_address = Some((*value).to_owned()),
            "rport" => c.base_port = Some(value.parse()?),
            "ttl" => c.ttl = Some(value.parse()?),
            "ufrag" => c.username = Some((*value).to_owned()),
            "pwd" => c.password = Some((*value).to_owned()),
            _ => return Err(Error::ErrUnknownCandidateAttribute((*key).to_owned())),
        }
    }

    c.validate()?;
    Ok(c)
}

/// Serializes an ordered candidate list, one line per candidate.
pub fn marshal_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(Candidate::marshal)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses a list produced by [`marshal_candidates`], keeping its order.
pub fn unmarshal_candidates(raw: &str) -> Result<Vec<Candidate>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(unmarshal_candidate)
        .collect()
}

/// Finds a candidate by foundation, ignoring case.
pub fn find_candidate_by_foundation<'a>(
    candidates: &'a [Candidate],
    foundation: &str,
) -> Option<&'a Candidate> {
    candidates
        .iter()
        .find(|c| c.foundation.eq_ignore_ascii_case(foundation))
}
