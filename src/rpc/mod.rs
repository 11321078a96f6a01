pub mod client;
pub mod dispatch;
pub mod framing;
pub mod server;
