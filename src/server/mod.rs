pub mod builder;
pub mod handler;
pub mod listener;

pub use builder::{ConnectInfo, ServerBuilder};
pub use handler::RequestHandler;