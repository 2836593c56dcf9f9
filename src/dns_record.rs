use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 5;

/// DNS Question Section
/// Format: QNAME + QTYPE (2 bytes) + QCLASS (2 bytes)
///
/// The name is kept as the raw dotted bytes from the wire; turning it into
/// text is left to whoever needs it, because labels are not guaranteed to be
/// valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: Bytes,
    pub qtype: u16,
    pub qclass: u16,
}

/// Common DNS record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A = 1,     // IPv4 address
    NS = 2,    // Name server
    CNAME = 5, // Canonical name
    SOA = 6,   // Start of authority
    PTR = 12,  // Pointer record
    MX = 15,   // Mail exchange
    TXT = 16,  // Text record
    AAAA = 28, // IPv6 address
    OPT = 41,  // EDNS0 option
    ANY = 255, // All records
}

impl RecordType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordType::A),
            2 => Some(RecordType::NS),
            5 => Some(RecordType::CNAME),
            6 => Some(RecordType::SOA),
            12 => Some(RecordType::PTR),
            15 => Some(RecordType::MX),
            16 => Some(RecordType::TXT),
            28 => Some(RecordType::AAAA),
            41 => Some(RecordType::OPT),
            255 => Some(RecordType::ANY),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Human readable name for logging, falling back to the numeric form
    pub fn describe(value: u16) -> String {
        match Self::from_u16(value) {
            Some(rtype) => format!("{:?}", rtype),
            None => format!("TYPE{}", value),
        }
    }
}

/// Internet class; the only one this server answers for
pub const CLASS_IN: u16 = 1;

/// SOA record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Typed record payload. Names inside RDATA are decoded so that compression
/// pointers from an upstream message never leak into our own responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A([u8; 4]),
    Aaaa([u8; 16]),
    Cname(String),
    Ns(String),
    Ptr(String),
    Soa(Soa),
    Unknown { rtype: u16, data: Vec<u8> },
}

impl RData {
    pub fn rtype(&self) -> u16 {
        match self {
            RData::A(_) => RecordType::A.to_u16(),
            RData::Aaaa(_) => RecordType::AAAA.to_u16(),
            RData::Cname(_) => RecordType::CNAME.to_u16(),
            RData::Ns(_) => RecordType::NS.to_u16(),
            RData::Ptr(_) => RecordType::PTR.to_u16(),
            RData::Soa(_) => RecordType::SOA.to_u16(),
            RData::Unknown { rtype, .. } => *rtype,
        }
    }

    fn parse(bytes: &[u8], offset: usize, rtype: u16, rdlength: usize) -> Result<Self, WireError> {
        let data = &bytes[offset..offset + rdlength];

        let rdata = match RecordType::from_u16(rtype) {
            Some(RecordType::A) if rdlength == 4 => {
                RData::A([data[0], data[1], data[2], data[3]])
            }
            Some(RecordType::AAAA) if rdlength == 16 => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(data);
                RData::Aaaa(ip)
            }
            Some(RecordType::CNAME) => RData::Cname(parse_domain_text(bytes, offset)?.0),
            Some(RecordType::NS) => RData::Ns(parse_domain_text(bytes, offset)?.0),
            Some(RecordType::PTR) => RData::Ptr(parse_domain_text(bytes, offset)?.0),
            Some(RecordType::SOA) => {
                let (mname, next) = parse_domain_text(bytes, offset)?;
                let (rname, next) = parse_domain_text(bytes, next)?;
                if next + 20 > offset + rdlength {
                    return Err(WireError::Truncated("SOA fields"));
                }
                let mut fields = &bytes[next..next + 20];
                RData::Soa(Soa {
                    mname,
                    rname,
                    serial: fields.get_u32(),
                    refresh: fields.get_u32(),
                    retry: fields.get_u32(),
                    expire: fields.get_u32(),
                    minimum: fields.get_u32(),
                })
            }
            _ => RData::Unknown {
                rtype,
                data: data.to_vec(),
            },
        };

        Ok(rdata)
    }

    fn write_to(&self, out: &mut BytesMut) -> Result<(), WireError> {
        match self {
            RData::A(ip) => out.put_slice(ip),
            RData::Aaaa(ip) => out.put_slice(ip),
            RData::Cname(target) | RData::Ns(target) | RData::Ptr(target) => {
                encode_domain_name(target, out)?
            }
            RData::Soa(soa) => {
                encode_domain_name(&soa.mname, out)?;
                encode_domain_name(&soa.rname, out)?;
                out.put_u32(soa.serial);
                out.put_u32(soa.refresh);
                out.put_u32(soa.retry);
                out.put_u32(soa.expire);
                out.put_u32(soa.minimum);
            }
            RData::Unknown { data, .. } => out.put_slice(data),
        }
        Ok(())
    }
}

/// DNS Resource Record
/// Format: NAME + TYPE (2 bytes) + CLASS (2 bytes) + TTL (4 bytes) + RDLENGTH (2 bytes) + RDATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsQuestion {
    /// Parse a DNS question from bytes starting at the given offset
    /// Returns the question and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        if new_offset + 4 > bytes.len() {
            return Err(WireError::Truncated("question type and class"));
        }

        let mut fields = &bytes[new_offset..new_offset + 4];
        Ok((
            DnsQuestion {
                name: Bytes::from(name),
                qtype: fields.get_u16(),
                qclass: fields.get_u16(),
            },
            new_offset + 4,
        ))
    }

    pub fn write_to(&self, out: &mut BytesMut) -> Result<(), WireError> {
        encode_label_bytes(&self.name, out)?;
        out.put_u16(self.qtype);
        out.put_u16(self.qclass);
        Ok(())
    }
}

impl ResourceRecord {
    pub fn new(name: impl Into<String>, ttl: u32, rdata: RData) -> Self {
        ResourceRecord {
            name: name.into(),
            rclass: CLASS_IN,
            ttl,
            rdata,
        }
    }

    pub fn rtype(&self) -> u16 {
        self.rdata.rtype()
    }

    /// Parse a resource record from bytes starting at the given offset
    /// Returns the record and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_text(bytes, offset)?;

        if new_offset + 10 > bytes.len() {
            return Err(WireError::Truncated("record fields"));
        }

        let mut fields = &bytes[new_offset..new_offset + 10];
        let rtype = fields.get_u16();
        let rclass = fields.get_u16();
        let ttl = fields.get_u32();
        let rdlength = fields.get_u16() as usize;

        let data_offset = new_offset + 10;
        if data_offset + rdlength > bytes.len() {
            return Err(WireError::Truncated("RDATA"));
        }

        let rdata = RData::parse(bytes, data_offset, rtype, rdlength)?;

        Ok((
            ResourceRecord {
                name,
                rclass,
                ttl,
                rdata,
            },
            data_offset + rdlength,
        ))
    }

    pub fn write_to(&self, out: &mut BytesMut) -> Result<(), WireError> {
        encode_domain_name(&self.name, out)?;
        out.put_u16(self.rtype());
        out.put_u16(self.rclass);
        out.put_u32(self.ttl);

        let mut rdata = BytesMut::new();
        self.rdata.write_to(&mut rdata)?;
        let rdlength =
            u16::try_from(rdata.len()).map_err(|_| WireError::RdataTooLong(rdata.len()))?;
        out.put_u16(rdlength);
        out.put_slice(&rdata);

        Ok(())
    }
}

/// Parse a domain name from DNS message format
/// Supports DNS name compression (pointers)
/// Returns the raw dotted name and the new offset
pub fn parse_domain_name(bytes: &[u8], mut offset: usize) -> Result<(Vec<u8>, usize), WireError> {
    let mut labels: Vec<&[u8]> = Vec::new();
    let mut jumped = false;
    let mut jump_offset = offset;
    let mut jumps = 0;

    loop {
        if offset >= bytes.len() {
            return Err(WireError::NameOutOfBounds(offset));
        }

        let length = bytes[offset];

        if (length & 0xC0) == 0xC0 {
            if offset + 1 >= bytes.len() {
                return Err(WireError::Truncated("compression pointer"));
            }

            // Pointer: the next 14 bits indicate the offset
            let pointer = u16::from_be_bytes([bytes[offset] & 0x3F, bytes[offset + 1]]);

            if !jumped {
                jump_offset = offset + 2;
            }

            offset = pointer as usize;
            jumped = true;
            jumps += 1;

            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::TooManyJumps);
            }
            continue;
        }

        offset += 1;

        if length == 0 {
            break;
        }

        if offset + length as usize > bytes.len() {
            return Err(WireError::Truncated("label"));
        }

        labels.push(&bytes[offset..offset + length as usize]);
        offset += length as usize;
    }

    let final_offset = if jumped { jump_offset } else { offset };
    let domain_name = if labels.is_empty() {
        b".".to_vec() // Root domain
    } else {
        labels.join(&b'.')
    };

    Ok((domain_name, final_offset))
}

/// Like `parse_domain_name`, for names we only ever relay (record owners and
/// names inside RDATA). Invalid UTF-8 is replaced rather than rejected.
fn parse_domain_text(bytes: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let (name, new_offset) = parse_domain_name(bytes, offset)?;
    Ok((String::from_utf8_lossy(&name).into_owned(), new_offset))
}

/// Encode a domain name to DNS message format
/// Example: "example.com" -> [7]example[3]com[0]
/// An empty name or "." encodes as the root.
pub fn encode_domain_name(name: &str, out: &mut BytesMut) -> Result<(), WireError> {
    encode_label_bytes(name.as_bytes(), out)
}

fn encode_label_bytes(name: &[u8], out: &mut BytesMut) -> Result<(), WireError> {
    let mut written = 0;

    for label in name.split(|b| *b == b'.') {
        if label.is_empty() {
            continue;
        }

        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong(
                label.len(),
                String::from_utf8_lossy(label).into_owned(),
            ));
        }

        written += label.len() + 1;
        if written + 1 > MAX_NAME_LEN {
            return Err(WireError::NameTooLong(written + 1));
        }

        out.put_u8(label.len() as u8);
        out.put_slice(label);
    }

    out.put_u8(0);
    Ok(())
}

/// Check that a configured name can be put on the wire
pub fn validate_domain_name(name: &str) -> Result<(), WireError> {
    encode_domain_name(name, &mut BytesMut::new())
}
