pub mod connect;
pub mod context;
pub mod handler;
pub mod upstream;
pub mod websocket;

pub use context::BoxBody;
pub use handler::handle_request;
