//! Request guards that run in front of every route.

pub mod access;
pub mod csrf;
pub mod headers;
pub mod transport;
