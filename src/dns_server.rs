//! DNS server for the overlay zone.
//!
//! Names present in the [`DnsZone`] are answered locally with the most
//! recently applied address of the requested family.  Everything else is
//! forwarded to the system resolver through `hickory-resolver`.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::dns::DnsZone;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

const ZONE_TTL: u32 = 5;
const FORWARD_TTL: u32 = 60;

pub async fn run_dns_server(bind_addr: SocketAddr, zone: DnsZone) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        error!(
            "Failed to load system resolv.conf: {}. Falling back to Google DNS.",
            e
        );
        TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
    });

    let handler = OverlayDns { zone, resolver };
    let mut server = ServerFuture::new(handler);

    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    server.block_until_done().await?;
    Ok(())
}

struct OverlayDns {
    zone: DnsZone,
    resolver: TokioAsyncResolver,
}

impl OverlayDns {
    async fn forward(&self, name: &Name, qtype: RecordType) -> (ResponseCode, Vec<Record>) {
        let fqdn = fully_qualified(name);
        match self.resolver.lookup_ip(fqdn.clone()).await {
            Ok(lookup) => {
                let addrs: Vec<IpAddr> = lookup.iter().collect();
                (ResponseCode::NoError, records(name, qtype, &addrs, FORWARD_TTL))
            }
            Err(e) => {
                warn!("Resolver lookup failed for {}: {}", fqdn, e);
                (ResponseCode::ServFail, Vec::new())
            }
        }
    }
}

/// Forwarded names are absolute so the resolver never applies search domains.
fn fully_qualified(name: &Name) -> Name {
    let mut fqdn = name.clone();
    fqdn.set_fqdn(true);
    fqdn
}

#[async_trait]
impl RequestHandler for OverlayDns {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let qname = query.name().to_string().trim_end_matches('.').to_string();
        let qtype = query.query_type();
        let name: Name = query.name().clone().into();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        let (code, answers) = match self.zone.lookup(&qname).await {
            Some(entry) => {
                debug!("answering {} {:?} from overlay zone", qname, qtype);
                let addrs: Vec<IpAddr> = entry.addresses().collect();
                (ResponseCode::NoError, records(&name, qtype, &addrs, ZONE_TTL))
            }
            None => self.forward(&name, qtype).await,
        };
        header.set_response_code(code);

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            answers.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response for {}: {}", qname, e);
                let mut header = header;
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// Answer records for the addresses matching `qtype`.
fn records(name: &Name, qtype: RecordType, addrs: &[IpAddr], ttl: u32) -> Vec<Record> {
    addrs
        .iter()
        .filter_map(|addr| match (*addr, qtype) {
            (IpAddr::V4(ipv4), RecordType::A | RecordType::ANY) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::A(A(ipv4))))
            }
            (IpAddr::V6(ipv6), RecordType::AAAA | RecordType::ANY) => {
                Some(Record::from_rdata(name.clone(), ttl, RData::AAAA(AAAA(ipv6))))
            }
            _ => None,
        })
        .collect()
}
