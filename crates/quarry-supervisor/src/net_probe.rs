//! Local and public address discovery.
//!
//! Used by the host to show players what address to connect to. Public
//! lookup is best effort and network bound; callers run it off any thread
//! that owns UI responsiveness.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

const PUBLIC_ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

const ECHO_SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel returned when every echo service fails.
pub const PUBLIC_ADDRESS_UNAVAILABLE: &str = "unavailable";

/// Loopback first, then the primary outbound IPv4 address when one exists.
/// First qualifying address wins; this is a good-enough heuristic, not an
/// exhaustive interface walk.
pub fn discover_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut out = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)];
    if let Some(ip) = primary_outbound_ipv4()
        && !ip.is_loopback()
        && !ip.is_link_local()
        && !ip.is_multicast()
        && !ip.is_unspecified()
    {
        out.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    out
}

// Connecting a UDP socket sends nothing; the OS just resolves the route
// and binds the local side, which tells us the outbound interface address.
fn primary_outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("203.0.113.1", 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

/// Ask external echo services for our public-facing IPv4 address. Services
/// are tried in order; the first syntactically valid answer wins, and
/// [`PUBLIC_ADDRESS_UNAVAILABLE`] is returned when all of them fail.
pub async fn discover_public_address(client: &reqwest::Client) -> String {
    probe_echo_services(client, PUBLIC_ECHO_SERVICES, ECHO_SERVICE_TIMEOUT).await
}

async fn probe_echo_services(
    client: &reqwest::Client,
    services: &[&str],
    per_service: Duration,
) -> String {
    for service in services {
        let attempt = async {
            let resp = client.get(*service).send().await.ok()?;
            let body = resp.text().await.ok()?;
            parse_ipv4_literal(&body)
        };
        match tokio::time::timeout(per_service, attempt).await {
            Ok(Some(ip)) => return ip.to_string(),
            Ok(None) => tracing::debug!(service, "echo service gave no usable address"),
            Err(_) => tracing::debug!(service, "echo service timed out"),
        }
    }
    PUBLIC_ADDRESS_UNAVAILABLE.to_string()
}

fn parse_ipv4_literal(body: &str) -> Option<Ipv4Addr> {
    body.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn loopback_is_always_first() {
        let addrs = discover_local_addresses(25565);
        assert_eq!(addrs[0], "127.0.0.1:25565".parse().unwrap());
    }

    #[test]
    fn non_loopback_entries_are_qualified() {
        for addr in discover_local_addresses(25565).into_iter().skip(1) {
            let IpAddr::V4(ip) = addr.ip() else {
                panic!("only IPv4 expected");
            };
            assert!(!ip.is_loopback());
            assert!(!ip.is_link_local());
            assert!(!ip.is_multicast());
        }
    }

    #[test]
    fn ipv4_literal_parsing() {
        assert_eq!(
            parse_ipv4_literal("203.0.113.7\n"),
            Some(Ipv4Addr::new(203, 0, 113, 7))
        );
        assert_eq!(parse_ipv4_literal("  198.51.100.2  "), Some(Ipv4Addr::new(198, 51, 100, 2)));
        assert_eq!(parse_ipv4_literal("<html>error</html>"), None);
        assert_eq!(parse_ipv4_literal("2001:db8::1"), None);
        assert_eq!(parse_ipv4_literal(""), None);
    }

    async fn echo_once(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.shutdown().await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn first_valid_echo_answer_wins() {
        let bad = echo_once("<html>not an address</html>").await;
        let good = echo_once("203.0.113.7\n").await;
        let client = reqwest::Client::new();

        let answer = probe_echo_services(
            &client,
            &[bad.as_str(), good.as_str()],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(answer, "203.0.113.7");
    }

    #[tokio::test]
    async fn all_failures_yield_the_sentinel() {
        let client = reqwest::Client::new();
        // Nothing listens on port 1.
        let answer = probe_echo_services(
            &client,
            &["http://127.0.0.1:1/"],
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(answer, PUBLIC_ADDRESS_UNAVAILABLE);
    }
}
