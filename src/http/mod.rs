pub mod dns_resolver;
pub mod first_byte;
pub mod tracer;
pub mod transport;
