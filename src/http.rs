//! HTTP body/request/response aliases, mirroring the teacher's
//! `http/mod.rs` (`crates/agentgateway/src/http/mod.rs`): a thin set of
//! type aliases over `axum_core`/`http`/`http-body` so the rest of the
//! crate names one `Body` type instead of juggling generics.

pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub type Error = axum_core::Error;
