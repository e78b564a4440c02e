//! Just enough of the DNS wire format for this scanner: building a query
//! carrying an EDNS OPT record with Client-Subnet (RFC 7871) and NSID
//! (RFC 5001) options, and parsing the answer/additional sections of the
//! response back out.
//!
//! Everything is big-endian on the wire; see RFC 1035 §4 for the message
//! layout and RFC 6891 for the OPT pseudo-RR.
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ECSError, ECSResult};

pub const MAX_DNS_PACKET_SIZE: usize = 4096;

const CLASS_IN: u16 = 1;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

// EDNS0 option codes, see the IANA DNS parameters registry
const EDNS_OPT_NSID: u16 = 3;
const EDNS_OPT_CLIENT_SUBNET: u16 = 8;

/// The record types this codec knows how to emit or interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum QType {
    A = 1,
    NS = 2,
    CNAME = 5,
    AAAA = 28,
    OPT = 41,
}

impl QType {
    fn from_u16(value: u16) -> Option<QType> {
        match value {
            1 => Some(QType::A),
            2 => Some(QType::NS),
            5 => Some(QType::CNAME),
            28 => Some(QType::AAAA),
            41 => Some(QType::OPT),
            _ => None,
        }
    }
}

/// Client-subnet parameters attached to an outbound query.
#[derive(Debug, Clone)]
pub struct EcsOption {
    pub family: u16,
    pub source_prefix_length: u8,
    pub address: IpAddr,
}

/// The parts of a response the scanner cares about.
#[derive(Debug, Default)]
pub struct DNSResponse {
    pub id: u16,
    pub response_code: u8,
    pub answers: Vec<IpAddr>,
    pub cnames: Vec<String>,
    pub nameservers: Vec<String>,
    pub scope_prefix_length: u8,
    pub nsid: String,
}

/// Serialize a single-question query. The OPT pseudo-RR is appended whenever
/// an ECS option or NSID is requested.
pub fn build_query(
    id: u16,
    qname: &str,
    qtype: QType,
    recursion_desired: bool,
    ecs: Option<&EcsOption>,
    nsid: bool,
) -> ECSResult<Vec<u8>> {
    let mut buffer: Vec<u8> = Vec::with_capacity(64);

    let flags = if recursion_desired { FLAG_RECURSION_DESIRED } else { 0 };
    let has_opt = ecs.is_some() || nsid;

    buffer.write_u16::<BigEndian>(id)?;
    buffer.write_u16::<BigEndian>(flags)?;
    buffer.write_u16::<BigEndian>(1)?; // qdcount
    buffer.write_u16::<BigEndian>(0)?; // ancount
    buffer.write_u16::<BigEndian>(0)?; // nscount
    buffer.write_u16::<BigEndian>(has_opt as u16)?; // arcount

    write_name(&mut buffer, qname)?;
    buffer.write_u16::<BigEndian>(qtype as u16)?;
    buffer.write_u16::<BigEndian>(CLASS_IN)?;

    if has_opt {
        let mut rdata: Vec<u8> = Vec::new();
        if let Some(ecs) = ecs {
            // RFC 7871 §6: family, source prefix length, scope prefix length
            // (0 in queries), then just enough address octets
            let n_octets = (ecs.source_prefix_length as usize + 7) / 8;
            let octets: Vec<u8> = match ecs.address {
                IpAddr::V4(v4) => v4.octets()[..n_octets].to_vec(),
                IpAddr::V6(v6) => v6.octets()[..n_octets].to_vec(),
            };

            rdata.write_u16::<BigEndian>(EDNS_OPT_CLIENT_SUBNET)?;
            rdata.write_u16::<BigEndian>((4 + octets.len()) as u16)?;
            rdata.write_u16::<BigEndian>(ecs.family)?;
            rdata.write_u8(ecs.source_prefix_length)?;
            rdata.write_u8(0)?;
            rdata.extend_from_slice(&octets);
        }
        if nsid {
            rdata.write_u16::<BigEndian>(EDNS_OPT_NSID)?;
            rdata.write_u16::<BigEndian>(0)?;
        }

        buffer.write_u8(0)?; // root owner name
        buffer.write_u16::<BigEndian>(QType::OPT as u16)?;
        buffer.write_u16::<BigEndian>(MAX_DNS_PACKET_SIZE as u16)?; // payload size
        buffer.write_u32::<BigEndian>(0)?; // extended rcode + flags
        buffer.write_u16::<BigEndian>(rdata.len() as u16)?;
        buffer.extend_from_slice(&rdata);
    }

    Ok(buffer)
}

/// Parse a response buffer: A/AAAA answers, CNAMEs, NS names, and the ECS
/// scope and NSID from the OPT record in the additional section.
pub fn parse_response(buf: &[u8]) -> ECSResult<DNSResponse> {
    let mut cursor = Cursor::new(buf);
    let mut response = DNSResponse::default();

    response.id = cursor.read_u16::<BigEndian>()?;
    let flags = cursor.read_u16::<BigEndian>()?;
    response.response_code = (flags & 0x000F) as u8;
    let qd_count = cursor.read_u16::<BigEndian>()?;
    let an_count = cursor.read_u16::<BigEndian>()?;
    let ns_count = cursor.read_u16::<BigEndian>()?;
    let ar_count = cursor.read_u16::<BigEndian>()?;

    for _ in 0..qd_count {
        read_name(&mut cursor, buf)?;
        cursor.read_u16::<BigEndian>()?; // qtype
        cursor.read_u16::<BigEndian>()?; // qclass
    }

    // answer and authority sections share the RR layout
    for section in [an_count, ns_count] {
        for _ in 0..section {
            read_record(&mut cursor, buf, &mut response)?;
        }
    }

    for _ in 0..ar_count {
        read_additional(&mut cursor, buf, &mut response)?;
    }

    Ok(response)
}

fn read_record(cursor: &mut Cursor<&[u8]>, buf: &[u8], response: &mut DNSResponse) -> ECSResult<()> {
    read_name(cursor, buf)?;
    let rr_type = cursor.read_u16::<BigEndian>()?;
    cursor.read_u16::<BigEndian>()?; // class
    cursor.read_u32::<BigEndian>()?; // ttl
    let rd_length = cursor.read_u16::<BigEndian>()? as u64;
    let rdata_start = cursor.position();

    match QType::from_u16(rr_type) {
        Some(QType::A) if rd_length == 4 => {
            let addr = cursor.read_u32::<BigEndian>()?;
            response.answers.push(IpAddr::V4(Ipv4Addr::from(addr)));
        }
        Some(QType::AAAA) if rd_length == 16 => {
            let mut octets = [0u8; 16];
            for octet in octets.iter_mut() {
                *octet = cursor.read_u8()?;
            }
            response.answers.push(IpAddr::V6(Ipv6Addr::from(octets)));
        }
        Some(QType::CNAME) => {
            let cname = read_name(cursor, buf)?;
            response.cnames.push(cname);
        }
        Some(QType::NS) => {
            let ns = read_name(cursor, buf)?;
            response.nameservers.push(ns);
        }
        _ => {}
    }

    cursor.set_position(rdata_start + rd_length);
    Ok(())
}

fn read_additional(
    cursor: &mut Cursor<&[u8]>,
    buf: &[u8],
    response: &mut DNSResponse,
) -> ECSResult<()> {
    read_name(cursor, buf)?;
    let rr_type = cursor.read_u16::<BigEndian>()?;
    cursor.read_u16::<BigEndian>()?; // class (payload size for OPT)
    cursor.read_u32::<BigEndian>()?; // ttl
    let rd_length = cursor.read_u16::<BigEndian>()? as u64;
    let rdata_start = cursor.position();

    if QType::from_u16(rr_type) == Some(QType::OPT) {
        while cursor.position() < rdata_start + rd_length {
            let code = cursor.read_u16::<BigEndian>()?;
            let length = cursor.read_u16::<BigEndian>()? as usize;
            let start = cursor.position() as usize;
            let data = buf
                .get(start..start + length)
                .ok_or_else(|| ECSError::new("truncated OPT option"))?;

            match code {
                // family (2), source prefix length, scope prefix length, address
                EDNS_OPT_CLIENT_SUBNET if length >= 4 => {
                    response.scope_prefix_length = data[3];
                }
                EDNS_OPT_NSID => {
                    let hex: String = data.iter().map(|b| format!("{:02x}", b)).collect();
                    response.nsid = format!("0x{}", hex);
                }
                _ => {}
            }
            cursor.set_position((start + length) as u64);
        }
    }

    cursor.set_position(rdata_start + rd_length);
    Ok(())
}

fn write_name(buffer: &mut Vec<u8>, name: &str) -> ECSResult<()> {
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ECSError::DNS(format!("invalid label in name '{}'", name)));
        }
        buffer.write_u8(label.len() as u8)?;
        buffer.extend_from_slice(label.as_bytes());
    }
    buffer.write_u8(0)?;
    Ok(())
}

/// Read a (possibly compressed) domain name. The cursor ends up right after
/// the name as it appears in the message; compression pointers are chased
/// through `buf` with a jump budget against pointer loops.
fn read_name(cursor: &mut Cursor<&[u8]>, buf: &[u8]) -> ECSResult<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = cursor.position() as usize;
    let mut jumped = false;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or_else(|| ECSError::new("truncated name"))? as usize;

        if len == 0 {
            if !jumped {
                cursor.set_position((pos + 1) as u64);
            }
            break;
        }

        // RFC 1035 §4.1.4: two top bits set means a pointer
        if len & 0xC0 == 0xC0 {
            let low = *buf
                .get(pos + 1)
                .ok_or_else(|| ECSError::new("truncated compression pointer"))? as usize;
            if !jumped {
                cursor.set_position((pos + 2) as u64);
                jumped = true;
            }
            jumps += 1;
            if jumps > 16 {
                return Err(ECSError::new("compression pointer loop"));
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }

        let label = buf
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| ECSError::new("truncated label"))?;
        labels.push(std::str::from_utf8(label)?.to_string());
        pos += len + 1;
    }

    Ok(labels.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let ecs = EcsOption {
            family: 1,
            source_prefix_length: 24,
            address: "10.0.0.0".parse().unwrap(),
        };
        let buffer = build_query(0x1234, "example.com", QType::A, false, Some(&ecs), true).unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            // header
            0x12, 0x34, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
            // question
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
            0x00, 0x01, 0x00, 0x01,
            // OPT: root name, type 41, payload 4096, ttl 0, rdlen 15
            0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F,
            // ECS option: code 8, len 7, family 1, source 24, scope 0, 10.0.0
            0x00, 0x08, 0x00, 0x07, 0x00, 0x01, 0x18, 0x00, 0x0A, 0x00, 0x00,
            // NSID option: code 3, len 0
            0x00, 0x03, 0x00, 0x00,
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn recursion_desired_flag() {
        let buffer = build_query(1, "example.com", QType::NS, true, None, false).unwrap();
        assert_eq!(&buffer[2..4], &[0x01, 0x00]);
        // no additional records without OPT
        assert_eq!(&buffer[10..12], &[0x00, 0x00]);
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(build_query(1, "", QType::A, false, None, false).is_err());
        let long = "a".repeat(64);
        assert!(build_query(1, &format!("{}.com", long), QType::A, false, None, false).is_err());
    }

    // response with a CNAME chain, one A answer and an OPT carrying both an
    // ECS scope and an NSID
    #[rustfmt::skip]
    const SAMPLE_RESPONSE: &[u8] = &[
        // header: id 0x1234, QR+AA, qd 1, an 2, ns 0, ar 1
        0x12, 0x34, 0x84, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01,
        // question: example.com A IN
        0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
        0x00, 0x01, 0x00, 0x01,
        // answer 1: example.com CNAME www.example.com (compressed)
        0xC0, 0x0C, 0x00, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3C, 0x00, 0x06,
        0x03, b'w', b'w', b'w', 0xC0, 0x0C,
        // answer 2: A 1.2.3.4
        0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x3C, 0x00, 0x04,
        0x01, 0x02, 0x03, 0x04,
        // additional: OPT, payload 4096, rdlen 19
        0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x13,
        // ECS: family 1, source /24, scope /16, 10.0.0
        0x00, 0x08, 0x00, 0x07, 0x00, 0x01, 0x18, 0x10, 0x0A, 0x00, 0x00,
        // NSID: 0xdeadbeef
        0x00, 0x03, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF,
    ];

    #[test]
    fn response_parsing() {
        let response = parse_response(SAMPLE_RESPONSE).unwrap();
        assert_eq!(response.id, 0x1234);
        assert_eq!(response.response_code, 0);
        assert_eq!(response.answers, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
        assert_eq!(response.cnames, vec!["www.example.com"]);
        assert_eq!(response.scope_prefix_length, 16);
        assert_eq!(response.nsid, "0xdeadbeef");
    }

    #[test]
    fn pointer_loop_is_rejected() {
        // a name that points at itself
        let mut buf = SAMPLE_RESPONSE[..12].to_vec();
        buf.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
        assert!(parse_response(&buf).is_err());
    }
}
