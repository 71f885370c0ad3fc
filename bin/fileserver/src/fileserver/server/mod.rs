mod handlers;
mod layer;
mod router;
mod server_impl;

pub use server_impl::Server;
