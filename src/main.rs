mod answer;
mod dns_header;
mod dns_message;
mod dns_record;
mod error;
mod filter;
mod forwarder;
mod resolver;
mod server;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use filter::FilterConfig;
use forwarder::Forwarder;
use resolver::{DynamicResolver, ResolverChain};
use server::DnsServer;

/// Custom forwarding DNS server.
/// Redirects queries matching a regular expression to a given host.
#[derive(Parser, Debug)]
#[command(name = "dns-filter")]
struct Args {
    /// Log incoming requests to the console
    #[arg(short, long)]
    verbose: bool,

    /// DNS server port number
    #[arg(short, long, default_value_t = 10053)]
    port: u16,

    /// Destination CNAME
    #[arg(short, long)]
    cname: Option<String>,

    /// Nameserver 1
    #[arg(long)]
    ns1: Option<String>,

    /// Nameserver 2
    #[arg(long)]
    ns2: Option<String>,

    /// Regular expression to be checked (matched at the start of the name, ignoring case)
    #[arg(short, long)]
    regexp: Option<String>,

    /// Interface IP to listen on (empty for all interfaces)
    #[arg(short, long, default_value = "")]
    interface: String,

    /// Upstream DNS resolver for names that do not match (e.g., 8.8.8.8:53)
    #[arg(long)]
    resolver: Option<String>,

    /// Upstream timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

impl Args {
    fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip = if self.interface.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            self.interface
                .parse()
                .with_context(|| format!("invalid interface address {:?}", self.interface))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }

    fn filter_config(&self) -> anyhow::Result<FilterConfig> {
        let targets = [
            ("--cname", &self.cname),
            ("--ns1", &self.ns1),
            ("--ns2", &self.ns2),
        ];
        for (flag, value) in targets {
            if value.is_none() {
                warn!("{} not set, answers will carry the root name instead", flag);
            }
        }
        if self.regexp.is_none() {
            warn!("--regexp not set, no query will be redirected");
        }

        let config = FilterConfig::new(
            self.regexp.as_deref(),
            self.cname.clone().unwrap_or_default(),
            self.ns1.clone().unwrap_or_default(),
            self.ns2.clone().unwrap_or_default(),
            self.verbose,
        )?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    // Everything that can be misconfigured is checked before binding
    let config = args.filter_config().context("invalid configuration")?;
    let addr = args.listen_addr()?;

    let mut chain = ResolverChain::new().with(DynamicResolver::new(&config));
    if let Some(ref upstream) = args.resolver {
        info!(upstream = %upstream, "Forwarding unmatched queries");
        chain = chain.with(Forwarder::new(upstream.clone(), Duration::from_secs(args.timeout)));
    }
    info!(
        pattern = ?args.regexp,
        cname = ?args.cname,
        resolvers = chain.len(),
        "Resolver chain ready"
    );

    let server = DnsServer::bind(addr, Arc::new(chain))
        .with_context(|| format!("failed to bind {}", addr))?;

    server.run().context("DNS server stopped")?;
    Ok(())
}
