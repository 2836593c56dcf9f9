use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use tracing::debug;

use crate::answer::AnswerSet;
use crate::dns_header::{DnsHeader, ResponseCode, HEADER_LEN};
use crate::dns_message::build_query;
use crate::dns_record::{DnsQuestion, ResourceRecord};
use crate::error::{ResolveError, WireError};
use crate::resolver::{Query, Resolution, Resolver};

const MAX_UDP_RESPONSE: usize = 4096;

/// Fallback resolver that relays queries to an upstream server over UDP,
/// retrying over TCP when the UDP reply comes back truncated
pub struct Forwarder {
    addr: String,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Forwarder {
            addr: addr.into(),
            timeout,
        }
    }

    fn io_error(&self, source: std::io::Error) -> ResolveError {
        ResolveError::Upstream {
            addr: self.addr.clone(),
            source,
        }
    }

    fn upstream_addr(&self) -> Result<SocketAddr, ResolveError> {
        self.addr
            .to_socket_addrs()
            .map_err(|e| self.io_error(e))?
            .next()
            .ok_or_else(|| {
                self.io_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "upstream address resolved to nothing",
                ))
            })
    }

    fn exchange_udp(
        &self,
        upstream: SocketAddr,
        id: u16,
        request: &[u8],
    ) -> Result<Vec<u8>, ResolveError> {
        // Local socket must be of the same family as the upstream
        let local = match upstream {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local).map_err(|e| self.io_error(e))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| self.io_error(e))?;
        socket.connect(upstream).map_err(|e| self.io_error(e))?;
        socket.send(request).map_err(|e| self.io_error(e))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let size = socket.recv(&mut buf).map_err(|e| self.io_error(e))?;
            let header = DnsHeader::from_bytes(&buf[..size])?;
            // Stray datagrams with another id are dropped; the timeout bounds the wait
            if header.id == id {
                buf.truncate(size);
                return Ok(buf);
            }
            debug!(expected = id, got = header.id, "Ignoring upstream response with wrong id");
        }
    }

    fn exchange_tcp(
        &self,
        upstream: SocketAddr,
        id: u16,
        request: &[u8],
    ) -> Result<Vec<u8>, ResolveError> {
        let mut stream =
            TcpStream::connect_timeout(&upstream, self.timeout).map_err(|e| self.io_error(e))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| self.io_error(e))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| self.io_error(e))?;

        let len =
            u16::try_from(request.len()).map_err(|_| WireError::MessageTooLong(request.len()))?;
        stream
            .write_all(&len.to_be_bytes())
            .and_then(|_| stream.write_all(request))
            .map_err(|e| self.io_error(e))?;

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).map_err(|e| self.io_error(e))?;
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream
            .read_exact(&mut response)
            .map_err(|e| self.io_error(e))?;

        let header = DnsHeader::from_bytes(&response)?;
        if header.id != id {
            return Err(ResolveError::IdMismatch {
                expected: id,
                got: header.id,
            });
        }
        Ok(response)
    }
}

/// Split an upstream response into its record sections
fn parse_response(buf: &[u8]) -> Result<(DnsHeader, AnswerSet), WireError> {
    let header = DnsHeader::from_bytes(buf)?;

    let mut offset = HEADER_LEN;
    for _ in 0..header.question_count {
        let (_, new_offset) = DnsQuestion::from_bytes(buf, offset)?;
        offset = new_offset;
    }

    let mut read_section = |count: u16| -> Result<Vec<ResourceRecord>, WireError> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (record, new_offset) = ResourceRecord::from_bytes(buf, offset)?;
            records.push(record);
            offset = new_offset;
        }
        Ok(records)
    };

    let answers = read_section(header.answer_count)?;
    let authority = read_section(header.authority_count)?;
    let additional = read_section(header.additional_count)?;

    Ok((
        header,
        AnswerSet {
            answers,
            authority,
            additional,
        },
    ))
}

impl Resolver for Forwarder {
    fn query(&self, query: &Query) -> Result<Resolution, ResolveError> {
        let id = fastrand::u16(..);
        let question = DnsQuestion {
            name: query.name.clone(),
            qtype: query.qtype,
            qclass: query.qclass,
        };

        let request = build_query(id, &question)?;
        let upstream = self.upstream_addr()?;
        let mut response = self.exchange_udp(upstream, id, &request)?;
        if DnsHeader::from_bytes(&response)?.flags().tc {
            debug!(upstream = %self.addr, "Truncated upstream reply, retrying over TCP");
            response = self.exchange_tcp(upstream, id, &request)?;
        }
        let (header, set) = parse_response(&response)?;

        match header.flags().rcode {
            ResponseCode::NoError => {
                debug!(
                    upstream = %self.addr,
                    answers = set.answers.len(),
                    "Upstream answered"
                );
                Ok(Resolution::Answered(set))
            }
            ResponseCode::NxDomain => Ok(Resolution::NotOwned),
            rcode => Err(ResolveError::UpstreamFailure {
                addr: self.addr.clone(),
                rcode: rcode.to_u8(),
            }),
        }
    }
}
