//! Operator status listing.

use std::net::SocketAddrV4;

use crate::config::ProxyConfig;
use crate::relay::Relay;
use crate::table::{Routing, SessionEntry};

/// Renders the configuration followed by two lines per valid session.
#[must_use]
pub fn render(relay: &Relay) -> String {
    let config = relay.config().get();
    let mut out = format!("{config}\n");
    for (port, entry) in relay.table().sessions() {
        out.push_str(&session_lines(port, &config, &entry));
    }
    out
}

/// Renders one session as it appears in the status listing.
#[must_use]
pub fn session_lines(port: u16, config: &ProxyConfig, entry: &SessionEntry) -> String {
    let int_proxy = SocketAddrV4::new(config.int_proxy_addr, port);
    let ext_proxy = SocketAddrV4::new(config.ext_proxy_addr, port);
    flow_lines(
        (entry.sender, int_proxy, ext_proxy, entry.sbc),
        (entry.sbc, ext_proxy, int_proxy, entry.receiver),
    )
}

/// Renders a derived routing context.
#[must_use]
pub fn routing_lines(routing: &Routing) -> String {
    let header = if routing.loopback {
        "ROUTING (loopback)\n"
    } else {
        "ROUTING\n"
    };
    let mut out = String::from(header);
    out.push_str(&flow_lines(
        (routing.int_src, routing.int_proxy, routing.ext_proxy, routing.ext_dst),
        (routing.ext_src, routing.ext_proxy, routing.int_proxy, routing.int_dst),
    ));
    out
}

type Flow = (SocketAddrV4, SocketAddrV4, SocketAddrV4, SocketAddrV4);

fn flow_lines(forward: Flow, backward: Flow) -> String {
    let (a, b, c, d) = forward;
    let (e, f, g, h) = backward;
    format!("=> ({a} -> {b}) ~> ({c} -> {d})\n < ({e} -> {f}) ~> ({g} -> {h})\n")
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::table::SessionEndpoints;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_render_empty() {
        let relay = Relay::new();
        assert_eq!(
            render(&relay),
            "config: int_proxy_addr: 0.0.0.0 ext_proxy_addr: 0.0.0.0 smoothing: 1 loopback: 1\n"
        );
    }

    #[test]
    fn test_render_sessions_in_port_order() {
        let relay = Relay::with_config(ProxyConfig {
            int_proxy_addr: Ipv4Addr::new(1, 1, 1, 1),
            ext_proxy_addr: Ipv4Addr::new(2, 2, 2, 2),
            smoothing: true,
            loopback: false,
        });
        relay.table().update(
            40000,
            SessionEndpoints {
                sender: addr("0.0.0.0:0"),
                receiver: addr("10.0.0.2:5002"),
                sbc: addr("9.9.9.9:6000"),
            },
        );
        relay.table().update(
            32768,
            SessionEndpoints {
                sender: addr("192.168.100.8:18562"),
                receiver: addr("192.168.100.8:18560"),
                sbc: addr("213.30.241.190:40960"),
            },
        );

        let expected = "\
config: int_proxy_addr: 1.1.1.1 ext_proxy_addr: 2.2.2.2 smoothing: 1 loopback: 0
=> (192.168.100.8:18562 -> 1.1.1.1:32768) ~> (2.2.2.2:32768 -> 213.30.241.190:40960)
 < (213.30.241.190:40960 -> 2.2.2.2:32768) ~> (1.1.1.1:32768 -> 192.168.100.8:18560)
=> (0.0.0.0:0 -> 1.1.1.1:40000) ~> (2.2.2.2:40000 -> 9.9.9.9:6000)
 < (9.9.9.9:6000 -> 2.2.2.2:40000) ~> (1.1.1.1:40000 -> 10.0.0.2:5002)
";
        assert_eq!(render(&relay), expected);
    }

    #[test]
    fn test_routing_lines() {
        let routing = Routing {
            int_src: addr("213.30.241.190:40960"),
            int_dst: addr("213.30.241.190:40960"),
            int_proxy: addr("2.2.2.2:32768"),
            ext_proxy: addr("2.2.2.2:32768"),
            ext_src: addr("213.30.241.190:40960"),
            ext_dst: addr("213.30.241.190:40960"),
            loopback: true,
            smoothing: true,
        };
        let lines = routing_lines(&routing);
        assert!(lines.starts_with("ROUTING (loopback)\n=> (213.30.241.190:40960 -> 2.2.2.2:32768)"));
        assert_eq!(lines.lines().count(), 3);
    }
}
