//! DHCPv6 client wire codec for prefix delegation.
//!
//! Covers the client side of the 4-message exchange
//! (SOLICIT/ADVERTISE/REQUEST/REPLY) plus RENEW and REBIND, with the IA_PD
//! and IA Prefix options from RFC 8415. Only what a PD client needs is
//! implemented; unknown options are carried through or skipped.

use std::net::Ipv6Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Dhcpv6Error;

/// DHCPv6 client port.
pub const CLIENT_PORT: u16 = 546;
/// DHCPv6 server port.
pub const SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers multicast group (ff02::1:2).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// DHCPv6 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl TryFrom<u8> for MessageType {
    type Error = Dhcpv6Error;

    fn try_from(value: u8) -> Result<Self, Dhcpv6Error> {
        match value {
            1 => Ok(Self::Solicit),
            2 => Ok(Self::Advertise),
            3 => Ok(Self::Request),
            4 => Ok(Self::Confirm),
            5 => Ok(Self::Renew),
            6 => Ok(Self::Rebind),
            7 => Ok(Self::Reply),
            8 => Ok(Self::Release),
            9 => Ok(Self::Decline),
            10 => Ok(Self::Reconfigure),
            11 => Ok(Self::InformationRequest),
            12 => Ok(Self::RelayForw),
            13 => Ok(Self::RelayRepl),
            other => Err(Dhcpv6Error::UnknownMessageType(other)),
        }
    }
}

/// Option codes used by the PD client.
pub const OPTION_CLIENT_ID: u16 = 1;
pub const OPTION_SERVER_ID: u16 = 2;
pub const OPTION_ORO: u16 = 6;
pub const OPTION_ELAPSED_TIME: u16 = 8;
pub const OPTION_STATUS_CODE: u16 = 13;
pub const OPTION_DNS_SERVERS: u16 = 23;
pub const OPTION_IA_PD: u16 = 25;
pub const OPTION_IA_PREFIX: u16 = 26;

/// DHCPv6 status codes (RFC 8415 section 21.13).
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;

/// DUID-LL (type 3) for an Ethernet link-layer address.
pub fn duid_ll(mac: &[u8; 6]) -> Vec<u8> {
    const DUID_TYPE_LL: u16 = 3;
    const HW_TYPE_ETHERNET: u16 = 1;

    let mut duid = Vec::with_capacity(10);
    duid.extend_from_slice(&DUID_TYPE_LL.to_be_bytes());
    duid.extend_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
    duid.extend_from_slice(mac);
    duid
}

/// An IA Prefix option inside an IA_PD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPrefix {
    /// Preferred lifetime in seconds
    pub preferred_lifetime: u32,

    /// Valid lifetime in seconds
    pub valid_lifetime: u32,

    /// Delegated prefix length
    pub prefix_length: u8,

    /// Delegated prefix address
    pub prefix: Ipv6Addr,
}

/// A status code carried either at message level or inside an IA_PD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

/// An Identity Association for Prefix Delegation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IaPd {
    /// Identity Association identifier
    pub iaid: [u8; 4],

    /// Renewal time in seconds (0 = server left it to the client)
    pub t1: u32,

    /// Rebind time in seconds (0 = server left it to the client)
    pub t2: u32,

    /// Delegated prefixes
    pub prefixes: Vec<IaPrefix>,

    /// Status reported by the server for this IA_PD
    pub status: Option<Status>,
}

impl IaPd {
    /// The first prefix with a nonzero valid lifetime, if any. A REPLY whose
    /// prefixes all carry zero lifetimes is a withdrawal, not an acquisition.
    pub fn best_prefix(&self) -> Option<&IaPrefix> {
        self.prefixes.iter().find(|p| p.valid_lifetime > 0)
    }
}

/// A decoded or to-be-encoded DHCPv6 message, reduced to the options the
/// PD client works with.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,

    /// 24-bit transaction id
    pub transaction_id: u32,

    /// Client DUID
    pub client_id: Option<Vec<u8>>,

    /// Server DUID
    pub server_id: Option<Vec<u8>>,

    /// Requested option codes (Option Request Option)
    pub oro: Vec<u16>,

    /// Elapsed time in hundredths of a second
    pub elapsed_time: u16,

    /// IA_PD options
    pub ia_pds: Vec<IaPd>,

    /// Message-level status
    pub status: Option<Status>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: u32) -> Self {
        Self {
            message_type,
            transaction_id: transaction_id & 0x00FF_FFFF,
            client_id: None,
            server_id: None,
            oro: Vec::new(),
            elapsed_time: 0,
            ia_pds: Vec::new(),
            status: None,
        }
    }

    /// The IA_PD matching the given IAID, if present.
    pub fn ia_pd(&self, iaid: [u8; 4]) -> Option<&IaPd> {
        self.ia_pds.iter().find(|ia| ia.iaid == iaid)
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_u8(self.message_type as u8);
        let xid = self.transaction_id.to_be_bytes();
        buf.put_slice(&xid[1..4]);

        if let Some(client_id) = &self.client_id {
            put_option(&mut buf, OPTION_CLIENT_ID, client_id);
        }
        if let Some(server_id) = &self.server_id {
            put_option(&mut buf, OPTION_SERVER_ID, server_id);
        }

        put_option(&mut buf, OPTION_ELAPSED_TIME, &self.elapsed_time.to_be_bytes());

        if !self.oro.is_empty() {
            let mut oro = BytesMut::with_capacity(self.oro.len() * 2);
            for code in &self.oro {
                oro.put_u16(*code);
            }
            put_option(&mut buf, OPTION_ORO, &oro);
        }

        for ia_pd in &self.ia_pds {
            let mut body = BytesMut::with_capacity(12 + ia_pd.prefixes.len() * 29);
            body.put_slice(&ia_pd.iaid);
            body.put_u32(ia_pd.t1);
            body.put_u32(ia_pd.t2);
            for p in &ia_pd.prefixes {
                let mut prefix_body = BytesMut::with_capacity(25);
                prefix_body.put_u32(p.preferred_lifetime);
                prefix_body.put_u32(p.valid_lifetime);
                prefix_body.put_u8(p.prefix_length);
                prefix_body.put_slice(&p.prefix.octets());
                put_option(&mut body, OPTION_IA_PREFIX, &prefix_body);
            }
            put_option(&mut buf, OPTION_IA_PD, &body);
        }

        buf.freeze()
    }

    /// Parse a message from the wire format.
    pub fn decode(data: &[u8]) -> Result<Self, Dhcpv6Error> {
        if data.len() < 4 {
            return Err(Dhcpv6Error::Truncated(data.len()));
        }

        let message_type = MessageType::try_from(data[0])?;
        let transaction_id = u32::from_be_bytes([0, data[1], data[2], data[3]]);

        let mut msg = Message::new(message_type, transaction_id);

        for (code, payload) in OptionIter::new(&data[4..]) {
            let payload = payload?;
            match code {
                OPTION_CLIENT_ID => msg.client_id = Some(payload.to_vec()),
                OPTION_SERVER_ID => msg.server_id = Some(payload.to_vec()),
                OPTION_ELAPSED_TIME if payload.len() >= 2 => {
                    msg.elapsed_time = u16::from_be_bytes([payload[0], payload[1]]);
                }
                OPTION_ORO => {
                    msg.oro = payload
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                }
                OPTION_STATUS_CODE => msg.status = Some(parse_status(payload)?),
                OPTION_IA_PD => msg.ia_pds.push(parse_ia_pd(payload)?),
                _ => {}
            }
        }

        Ok(msg)
    }
}

fn put_option(buf: &mut BytesMut, code: u16, payload: &[u8]) {
    buf.put_u16(code);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

fn parse_status(payload: &[u8]) -> Result<Status, Dhcpv6Error> {
    if payload.len() < 2 {
        return Err(Dhcpv6Error::OptionTruncated {
            code: OPTION_STATUS_CODE,
            declared: 2,
            remaining: payload.len(),
        });
    }
    Ok(Status {
        code: u16::from_be_bytes([payload[0], payload[1]]),
        message: String::from_utf8_lossy(&payload[2..]).into_owned(),
    })
}

fn parse_ia_pd(payload: &[u8]) -> Result<IaPd, Dhcpv6Error> {
    if payload.len() < 12 {
        return Err(Dhcpv6Error::OptionTruncated {
            code: OPTION_IA_PD,
            declared: 12,
            remaining: payload.len(),
        });
    }

    let mut ia_pd = IaPd {
        iaid: [payload[0], payload[1], payload[2], payload[3]],
        t1: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        t2: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
        ..IaPd::default()
    };

    for (code, sub) in OptionIter::new(&payload[12..]) {
        let sub = sub?;
        match code {
            OPTION_IA_PREFIX => {
                if sub.len() < 25 {
                    return Err(Dhcpv6Error::OptionTruncated {
                        code: OPTION_IA_PREFIX,
                        declared: 25,
                        remaining: sub.len(),
                    });
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&sub[9..25]);
                ia_pd.prefixes.push(IaPrefix {
                    preferred_lifetime: u32::from_be_bytes([sub[0], sub[1], sub[2], sub[3]]),
                    valid_lifetime: u32::from_be_bytes([sub[4], sub[5], sub[6], sub[7]]),
                    prefix_length: sub[8],
                    prefix: Ipv6Addr::from(octets),
                });
            }
            OPTION_STATUS_CODE => ia_pd.status = Some(parse_status(sub)?),
            _ => {}
        }
    }

    Ok(ia_pd)
}

/// Iterator over DHCPv6 TLV options in a byte slice.
struct OptionIter<'a> {
    data: &'a [u8],
}

impl<'a> OptionIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, Result<&'a [u8], Dhcpv6Error>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < 4 {
            let err = Dhcpv6Error::Truncated(self.data.len());
            self.data = &[];
            return Some((0, Err(err)));
        }

        let code = u16::from_be_bytes([self.data[0], self.data[1]]);
        let len = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
        let rest = &self.data[4..];

        if rest.len() < len {
            let err = Dhcpv6Error::OptionTruncated {
                code,
                declared: len,
                remaining: rest.len(),
            };
            self.data = &[];
            return Some((code, Err(err)));
        }

        let payload = &rest[..len];
        self.data = &rest[len..];
        Some((code, Ok(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solicit_round_trips() {
        let mut msg = Message::new(MessageType::Solicit, 0xABCDEF);
        msg.client_id = Some(duid_ll(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]));
        msg.oro = vec![OPTION_DNS_SERVERS];
        msg.ia_pds.push(IaPd {
            iaid: [0, 0, 0, 7],
            prefixes: vec![IaPrefix {
                preferred_lifetime: 0,
                valid_lifetime: 0,
                prefix_length: 56,
                prefix: Ipv6Addr::UNSPECIFIED,
            }],
            ..IaPd::default()
        });

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.message_type, MessageType::Solicit);
        assert_eq!(decoded.transaction_id, 0xABCDEF);
        assert_eq!(decoded.client_id, msg.client_id);
        assert_eq!(decoded.oro, vec![OPTION_DNS_SERVERS]);

        let ia_pd = decoded.ia_pd([0, 0, 0, 7]).unwrap();
        assert_eq!(ia_pd.prefixes.len(), 1);
        assert_eq!(ia_pd.prefixes[0].prefix_length, 56);
    }

    #[test]
    fn reply_with_delegated_prefix_decodes() {
        let mut reply = Message::new(MessageType::Reply, 1);
        reply.server_id = Some(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]);
        reply.ia_pds.push(IaPd {
            iaid: [1, 2, 3, 4],
            t1: 1800,
            t2: 2880,
            prefixes: vec![IaPrefix {
                preferred_lifetime: 2700,
                valid_lifetime: 3600,
                prefix_length: 48,
                prefix: "2001:db8:1::".parse().unwrap(),
            }],
            status: None,
        });

        let decoded = Message::decode(&reply.encode()).unwrap();
        let ia_pd = decoded.ia_pd([1, 2, 3, 4]).unwrap();
        assert_eq!(ia_pd.t1, 1800);
        assert_eq!(ia_pd.t2, 2880);

        let best = ia_pd.best_prefix().unwrap();
        assert_eq!(best.prefix, "2001:db8:1::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(best.valid_lifetime, 3600);
    }

    #[test]
    fn zero_lifetime_prefixes_are_not_best() {
        let ia_pd = IaPd {
            iaid: [0; 4],
            prefixes: vec![
                IaPrefix {
                    preferred_lifetime: 0,
                    valid_lifetime: 0,
                    prefix_length: 56,
                    prefix: "2001:db8:dead::".parse().unwrap(),
                },
                IaPrefix {
                    preferred_lifetime: 600,
                    valid_lifetime: 1200,
                    prefix_length: 56,
                    prefix: "2001:db8:beef::".parse().unwrap(),
                },
            ],
            ..IaPd::default()
        };

        assert_eq!(
            ia_pd.best_prefix().unwrap().prefix,
            "2001:db8:beef::".parse::<Ipv6Addr>().unwrap()
        );

        let withdrawn = IaPd {
            prefixes: vec![IaPrefix {
                preferred_lifetime: 0,
                valid_lifetime: 0,
                prefix_length: 56,
                prefix: "2001:db8:dead::".parse().unwrap(),
            }],
            ..IaPd::default()
        };
        assert!(withdrawn.best_prefix().is_none());
    }

    #[test]
    fn ia_pd_status_code_decodes() {
        let mut status_body = BytesMut::new();
        status_body.put_slice(&[0, 0, 0, 9]); // IAID
        status_body.put_u32(0); // T1
        status_body.put_u32(0); // T2
        let mut status_opt = BytesMut::new();
        status_opt.put_u16(STATUS_NO_PREFIX_AVAIL);
        status_opt.put_slice(b"no prefixes left");
        put_option(&mut status_body, OPTION_STATUS_CODE, &status_opt);

        let mut wire = BytesMut::new();
        wire.put_u8(MessageType::Reply as u8);
        wire.put_slice(&[0, 0, 1]);
        put_option(&mut wire, OPTION_IA_PD, &status_body);

        let decoded = Message::decode(&wire).unwrap();
        let status = decoded.ia_pd([0, 0, 0, 9]).unwrap().status.as_ref().unwrap();
        assert_eq!(status.code, STATUS_NO_PREFIX_AVAIL);
        assert_eq!(status.message, "no prefixes left");
    }

    #[test]
    fn unknown_options_are_skipped() {
        let mut wire = BytesMut::new();
        wire.put_u8(MessageType::Advertise as u8);
        wire.put_slice(&[0, 0, 2]);
        put_option(&mut wire, 9999, &[1, 2, 3]);
        put_option(&mut wire, OPTION_SERVER_ID, &[0, 3, 0, 1, 9, 9, 9, 9, 9, 9]);

        let decoded = Message::decode(&wire).unwrap();
        assert!(decoded.server_id.is_some());
    }

    #[test]
    fn truncated_option_is_an_error() {
        let mut wire = BytesMut::new();
        wire.put_u8(MessageType::Reply as u8);
        wire.put_slice(&[0, 0, 3]);
        wire.put_u16(OPTION_SERVER_ID);
        wire.put_u16(10); // declares 10 bytes
        wire.put_slice(&[1, 2, 3]); // provides 3

        assert!(matches!(
            Message::decode(&wire).unwrap_err(),
            Dhcpv6Error::OptionTruncated { .. }
        ));
    }
}
