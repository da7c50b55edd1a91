pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const SCTP: u8 = 132;
}

pub mod port {
    pub const SUNRPC: u16 = 111;
    pub const SOCKS: u16 = 1080;
    pub const NFS: u16 = 2049;
    pub const BEEP: u16 = 10288;
}

/// 2 MiB, the largest application message the stream framers will wait for.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2 * 1024 * 1024;

pub fn ip_protocol_name(value: u8) -> &'static str {
    match value {
        ip_proto::ICMP => "icmp",
        ip_proto::TCP => "tcp",
        ip_proto::UDP => "udp",
        ip_proto::SCTP => "sctp",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::{ip_proto, ip_protocol_name};

    #[test]
    fn ip_protocol_names_cover_known_values() {
        assert_eq!(ip_protocol_name(ip_proto::TCP), "tcp");
        assert_eq!(ip_protocol_name(ip_proto::UDP), "udp");
        assert_eq!(ip_protocol_name(250), "unknown");
    }
}
