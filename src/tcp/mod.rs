mod frame;
mod tcp_control_messages;
mod tcp_endpoint;
mod tcp_receiver;
mod tcp_sender;
mod tcp_transport;

pub use tcp_endpoint::{format_address, parse_address};
pub use tcp_transport::TcpTransport;
