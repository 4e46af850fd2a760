pub mod pipeline;
pub mod server;
