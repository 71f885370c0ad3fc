mod handlers;
mod layer;
mod router;
mod server_impl;
mod session;

pub use server_impl::Server;
