//! Client-facing session core of a Redis Cluster proxy.
//!
//! A [`session::Session`] reads RESP commands from a client socket, routes
//! each one through an external [`dispatch::Dispatcher`], and writes replies
//! back in request order even though backends complete out of order. MOVED
//! and ASK redirections are followed transparently using pooled backend
//! connections from [`backend::pool::ConnPool`].

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod session;
pub mod utils;
