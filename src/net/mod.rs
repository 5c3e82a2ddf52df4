pub mod udp;

pub use udp::UdpEndpoint;
