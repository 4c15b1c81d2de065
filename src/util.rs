use std::net::Ipv4Addr;

const NODE_PORT: &str = "NODE_PORT";

const DEFAULT_PORT: u16 = 8080;

pub fn get_port() -> u16 {
    let port_from_env = std::env::var(NODE_PORT);
    port_from_env.map_or(DEFAULT_PORT, |res| parse_or(&res, DEFAULT_PORT))
}

const NODE_ADDR: &str = "NODE_ADDR";

const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

pub fn get_addr() -> Ipv4Addr {
    let addr_from_env = std::env::var(NODE_ADDR);
    addr_from_env.map_or(DEFAULT_ADDR, |res| parse_or(&res, DEFAULT_ADDR))
}

fn parse_or<T: std::str::FromStr>(value: &str, default: T) -> T {
    value.trim().parse().unwrap_or(default)
}

/// Round a CPU usage percentage to the integer reported by a status node
pub fn usage_to_status(usage: f32) -> i64 {
    if usage.is_finite() {
        usage.round().clamp(0.0, 100.0) as i64
    } else {
        0
    }
}
