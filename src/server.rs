use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::answer::AnswerSet;
use crate::dns_header::{DnsHeader, ResponseCode};
use crate::dns_message::{
    build_error_response, build_response, build_truncated, create_response_header, parse_request,
};
use crate::dns_record::RecordType;
use crate::resolver::{Query, Resolution, Resolver};

const MAX_UDP_PAYLOAD: usize = 512;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TCP_CONNECTIONS: usize = 128;

/// DNS Server that answers over UDP and TCP on the same address
pub struct DnsServer {
    udp: UdpSocket,
    tcp: TcpListener,
    resolver: Arc<dyn Resolver>,
    max_tcp_connections: usize,
}

impl DnsServer {
    /// Bind both listeners on the given address
    pub fn bind(addr: SocketAddr, resolver: Arc<dyn Resolver>) -> io::Result<Self> {
        let udp = UdpSocket::bind(addr)?;
        // Follow the UDP socket so that port 0 resolves to one port for both
        let tcp = TcpListener::bind(udp.local_addr()?)?;
        Ok(Self {
            udp,
            tcp,
            resolver,
            max_tcp_connections: MAX_TCP_CONNECTIONS,
        })
    }

    /// Connections beyond this many are closed right after accept
    pub fn with_max_tcp_connections(mut self, max: usize) -> Self {
        self.max_tcp_connections = max;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Serve TCP on a background thread and UDP on the calling one.
    /// Returns only if the UDP socket fails.
    pub fn run(&self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "DNS server listening on UDP and TCP");

        let listener = self.tcp.try_clone()?;
        let resolver = Arc::clone(&self.resolver);
        let limit = ConnectionLimit::new(self.max_tcp_connections);
        thread::spawn(move || serve_tcp(listener, resolver, limit));

        self.serve_udp()
    }

    fn serve_udp(&self) -> io::Result<()> {
        let mut buf = [0u8; MAX_UDP_PAYLOAD];

        loop {
            let (size, source) = match self.udp.recv_from(&mut buf) {
                Ok(received) => received,
                // ICMP port unreachable from an earlier reply shows up here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };
            debug!(bytes = size, %source, "UDP request");

            if let Some(response) = handle_request(self.resolver.as_ref(), &buf[..size], true) {
                if let Err(e) = self.udp.send_to(&response, source) {
                    warn!(%source, error = %e, "Failed to send UDP response");
                }
            }
        }
    }
}

/// Counts TCP connections being served
struct ConnectionLimit {
    active: AtomicUsize,
    max: usize,
}

/// Held by a connection thread; frees its slot on drop
struct ConnectionSlot(Arc<ConnectionLimit>);

impl ConnectionLimit {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(ConnectionLimit {
            active: AtomicUsize::new(0),
            max,
        })
    }

    fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max).then_some(active + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(self)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn serve_tcp(listener: TcpListener, resolver: Arc<dyn Resolver>, limit: Arc<ConnectionLimit>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to accept TCP connection");
                continue;
            }
        };

        let Some(slot) = limit.try_acquire() else {
            warn!(
                peer = ?stream.peer_addr().ok(),
                max = limit.max,
                "Too many TCP connections, closing"
            );
            continue;
        };

        let resolver = Arc::clone(&resolver);
        thread::spawn(move || {
            let _slot = slot;
            let peer = stream.peer_addr().ok();
            if let Err(e) = serve_tcp_connection(stream, resolver.as_ref()) {
                debug!(?peer, error = %e, "TCP connection closed");
            }
        });
    }
}

/// Serve length-prefixed messages until the peer closes or goes idle
fn serve_tcp_connection(mut stream: TcpStream, resolver: &dyn Resolver) -> io::Result<()> {
    stream.set_read_timeout(Some(TCP_IDLE_TIMEOUT))?;

    loop {
        let mut len = [0u8; 2];
        match stream.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut request = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut request)?;

        if let Some(response) = handle_request(resolver, &request, false) {
            let Ok(len) = u16::try_from(response.len()) else {
                warn!(bytes = response.len(), "Response too large for TCP framing");
                continue;
            };
            stream.write_all(&len.to_be_bytes())?;
            stream.write_all(&response)?;
        }
    }
}

/// Handle a DNS request: parse, resolve, and build response.
///
/// Returns `None` when nothing should be sent back (unreadable header or a
/// message that is itself a response).
pub fn handle_request(resolver: &dyn Resolver, buf: &[u8], udp: bool) -> Option<Vec<u8>> {
    let header = match DnsHeader::from_bytes(buf) {
        Ok(header) => header,
        Err(e) => {
            debug!(error = %e, "Dropping unreadable request");
            return None;
        }
    };

    let flags = header.flags();
    if flags.qr {
        return None;
    }
    if flags.opcode != 0 {
        return Some(build_error_response(&header, ResponseCode::NotImp));
    }

    let questions = match parse_request(buf) {
        Ok((_, questions)) if !questions.is_empty() => questions,
        Ok(_) => return Some(build_error_response(&header, ResponseCode::FormErr)),
        Err(e) => {
            debug!(id = header.id, error = %e, "Malformed request");
            return Some(build_error_response(&header, ResponseCode::FormErr));
        }
    };

    // Only the first question is resolved; the rest are echoed back
    let question = &questions[0];
    debug!(
        id = header.id,
        name = %String::from_utf8_lossy(&question.name),
        qtype = %RecordType::describe(question.qtype),
        "Query"
    );

    let resolution = if question.qtype == RecordType::ANY.to_u16() {
        resolver.lookup_all_records(&question.name)
    } else {
        resolver.query(&Query::from(question))
    };

    let (rcode, set) = match resolution {
        Ok(Resolution::Answered(set)) => (ResponseCode::NoError, set),
        Ok(Resolution::NotOwned) => (ResponseCode::NxDomain, AnswerSet::default()),
        Err(e) => {
            warn!(id = header.id, error = %e, "Resolver failed");
            (ResponseCode::ServFail, AnswerSet::default())
        }
    };

    let response_header = create_response_header(&header, rcode, questions.len() as u16, &set);
    let response = match build_response(&response_header, &questions, &set) {
        Ok(response) => response,
        Err(e) => {
            warn!(id = header.id, error = %e, "Failed to encode response");
            return Some(build_error_response(&header, ResponseCode::ServFail));
        }
    };

    if udp && response.len() > MAX_UDP_PAYLOAD {
        return build_truncated(&response_header, &questions).ok();
    }

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::{SOA_EXPIRE, SOA_MINIMUM, SOA_REFRESH, SOA_RETRY, SOA_SERIAL};
    use crate::dns_message::build_query;
    use crate::dns_record::{DnsQuestion, RData, ResourceRecord, CLASS_IN};
    use crate::error::ResolveError;
    use crate::filter::FilterConfig;
    use crate::resolver::{DynamicResolver, ResolverChain};
    use bytes::{Bytes, BytesMut};

    fn resolver() -> DynamicResolver {
        let config = FilterConfig::new(
            Some(r"^abcd.+?\.com$"),
            "xyz.net",
            "ns1.example.com.",
            "ns2.example.com.",
            false,
        )
        .unwrap();
        DynamicResolver::new(&config)
    }

    fn query_bytes(id: u16, name: &[u8], qtype: RecordType) -> Vec<u8> {
        let question = DnsQuestion {
            name: Bytes::copy_from_slice(name),
            qtype: qtype.to_u16(),
            qclass: CLASS_IN,
        };
        build_query(id, &question).unwrap()
    }

    /// Parse a response the way a client would
    fn read_response(message: &[u8]) -> (DnsHeader, Vec<ResourceRecord>) {
        let (header, questions) = parse_request(message).unwrap();
        let mut offset = 12;
        for question in &questions {
            let mut encoded = BytesMut::new();
            question.write_to(&mut encoded).unwrap();
            offset += encoded.len();
        }

        let total = header.answer_count + header.authority_count + header.additional_count;
        let mut records = Vec::new();
        for _ in 0..total {
            let (record, next) = ResourceRecord::from_bytes(message, offset).unwrap();
            records.push(record);
            offset = next;
        }
        assert_eq!(offset, message.len());
        (header, records)
    }

    struct Failing;

    impl Resolver for Failing {
        fn query(&self, _query: &Query) -> Result<Resolution, ResolveError> {
            Err(ResolveError::UpstreamFailure {
                addr: "192.0.2.53:53".to_string(),
                rcode: 5,
            })
        }
    }

    #[test]
    fn test_matching_query_gets_redirect() {
        let request = query_bytes(0x4242, b"abcd-example.com", RecordType::CNAME);
        let response = handle_request(&resolver(), &request, true).unwrap();
        let (header, records) = read_response(&response);

        assert_eq!(header.id, 0x4242);
        assert_eq!(header.flags().rcode, ResponseCode::NoError);
        assert!(header.flags().qr);
        assert_eq!(header.question_count, 1);
        assert_eq!(header.answer_count, 4);
        assert_eq!(header.authority_count, 0);
        assert_eq!(header.additional_count, 0);

        assert_eq!(records[0].name, "abcd-example.com");
        assert_eq!(records[0].rdata, RData::Cname("xyz.net".to_string()));
        match &records[1].rdata {
            RData::Soa(soa) => {
                assert_eq!(soa.serial, SOA_SERIAL);
                assert_eq!(soa.refresh, SOA_REFRESH);
                assert_eq!(soa.retry, SOA_RETRY);
                assert_eq!(soa.expire, SOA_EXPIRE);
                assert_eq!(soa.minimum, SOA_MINIMUM);
            }
            other => panic!("expected SOA, got {:?}", other),
        }
        assert_eq!(records[2].rdata, RData::Ns("ns1.example.com".to_string()));
        assert_eq!(records[3].rdata, RData::Ns("ns2.example.com".to_string()));
    }

    #[test]
    fn test_any_query_takes_all_records_path() {
        let request = query_bytes(0x10, b"ABCD-Example.COM", RecordType::ANY);
        let response = handle_request(&resolver(), &request, true).unwrap();
        let (header, records) = read_response(&response);

        assert_eq!(header.flags().rcode, ResponseCode::NoError);
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.name == "ABCD-Example.COM"));
    }

    #[test]
    fn test_non_matching_query_gets_nxdomain() {
        let request = query_bytes(1, b"other.org", RecordType::A);
        let response = handle_request(&resolver(), &request, true).unwrap();
        let (header, records) = read_response(&response);

        assert_eq!(header.flags().rcode, ResponseCode::NxDomain);
        assert!(records.is_empty());
    }

    #[test]
    fn test_undecodable_name_gets_nxdomain() {
        let request = query_bytes(2, &[0xFF, 0xFE, b'.', b'c', b'o', b'm'], RecordType::A);
        let response = handle_request(&resolver(), &request, true).unwrap();
        let (header, _) = read_response(&response);

        assert_eq!(header.flags().rcode, ResponseCode::NxDomain);
    }

    #[test]
    fn test_resolver_failure_gets_servfail() {
        let chain = ResolverChain::new().with(resolver()).with(Failing);

        let request = query_bytes(3, b"other.org", RecordType::A);
        let response = handle_request(&chain, &request, true).unwrap();
        assert_eq!(
            DnsHeader::from_bytes(&response).unwrap().flags().rcode,
            ResponseCode::ServFail
        );

        // Owned names are answered before the failing resolver is reached
        let request = query_bytes(4, b"abcd-1.com", RecordType::A);
        let response = handle_request(&chain, &request, true).unwrap();
        assert_eq!(
            DnsHeader::from_bytes(&response).unwrap().flags().rcode,
            ResponseCode::NoError
        );
    }

    #[test]
    fn test_garbage_is_dropped_or_rejected() {
        assert!(handle_request(&resolver(), &[1, 2, 3], true).is_none());

        // Valid header claiming a question that is not there
        let request = [0, 9, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        let response = handle_request(&resolver(), &request, true).unwrap();
        let header = DnsHeader::from_bytes(&response).unwrap();
        assert_eq!(header.id, 9);
        assert_eq!(header.flags().rcode, ResponseCode::FormErr);
    }

    #[test]
    fn test_responses_are_not_answered() {
        let mut request = query_bytes(5, b"abcd-1.com", RecordType::A);
        request[2] |= 0x80;
        assert!(handle_request(&resolver(), &request, true).is_none());
    }

    #[test]
    fn test_unsupported_opcode_gets_notimp() {
        let mut request = query_bytes(6, b"abcd-1.com", RecordType::A);
        request[2] |= 2 << 3; // opcode 2 (STATUS)
        let response = handle_request(&resolver(), &request, true).unwrap();
        assert_eq!(
            DnsHeader::from_bytes(&response).unwrap().flags().rcode,
            ResponseCode::NotImp
        );
    }

    #[test]
    fn test_oversized_udp_response_is_truncated() {
        struct Large;

        impl Resolver for Large {
            fn query(&self, query: &Query) -> Result<Resolution, ResolveError> {
                let name = String::from_utf8_lossy(&query.name).into_owned();
                let record = ResourceRecord::new(name, 60, RData::A([10, 0, 0, 1]));
                Ok(Resolution::Answered(AnswerSet {
                    answers: vec![record; 40],
                    ..AnswerSet::default()
                }))
            }
        }

        let request = query_bytes(7, b"big.example.com", RecordType::A);

        let udp = handle_request(&Large, &request, true).unwrap();
        let header = DnsHeader::from_bytes(&udp).unwrap();
        assert!(header.flags().tc);
        assert_eq!(header.answer_count, 0);

        let tcp = handle_request(&Large, &request, false).unwrap();
        let (header, records) = read_response(&tcp);
        assert!(!header.flags().tc);
        assert_eq!(records.len(), 40);
    }

    #[test]
    fn test_server_answers_over_udp_and_tcp() {
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(resolver())).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client
            .send_to(&query_bytes(10, b"abcd-udp.com", RecordType::A), addr)
            .unwrap();
        let mut buf = [0u8; 512];
        let (size, _) = client.recv_from(&mut buf).unwrap();
        let (header, _) = read_response(&buf[..size]);
        assert_eq!(header.id, 10);
        assert_eq!(header.answer_count, 4);

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let request = query_bytes(11, b"other.org", RecordType::A);
        stream
            .write_all(&(request.len() as u16).to_be_bytes())
            .unwrap();
        stream.write_all(&request).unwrap();

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).unwrap();
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut response).unwrap();
        let (header, _) = read_response(&response);
        assert_eq!(header.id, 11);
        assert_eq!(header.flags().rcode, ResponseCode::NxDomain);
    }

    fn tcp_exchange(stream: &mut TcpStream, request: &[u8]) -> io::Result<Vec<u8>> {
        stream.write_all(&(request.len() as u16).to_be_bytes())?;
        stream.write_all(request)?;
        let mut len = [0u8; 2];
        stream.read_exact(&mut len)?;
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut response)?;
        Ok(response)
    }

    #[test]
    fn test_connection_limit_frees_slots_on_drop() {
        let limit = ConnectionLimit::new(2);

        let first = limit.try_acquire().unwrap();
        let _second = limit.try_acquire().unwrap();
        assert!(limit.try_acquire().is_none());

        drop(first);
        assert!(limit.try_acquire().is_some());
    }

    #[test]
    fn test_tcp_connections_over_limit_are_closed() {
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(resolver()))
            .unwrap()
            .with_max_tcp_connections(1);
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());

        // The first connection is served and keeps its slot while open
        let mut held = TcpStream::connect(addr).unwrap();
        held.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let response = tcp_exchange(&mut held, &query_bytes(20, b"abcd-1.com", RecordType::A));
        assert_eq!(DnsHeader::from_bytes(&response.unwrap()).unwrap().id, 20);

        let mut rejected = TcpStream::connect(addr).unwrap();
        rejected.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let result = tcp_exchange(&mut rejected, &query_bytes(21, b"abcd-1.com", RecordType::A));
        assert!(result.is_err());
    }
}
