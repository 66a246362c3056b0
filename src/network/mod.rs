pub mod discovery;
pub mod link;
pub mod pairing;
pub mod payload;
pub mod port_pool;
pub mod tls;
