//! Local proxy bridging a stdio MCP client to a SigV4-signed HTTP endpoint.
//!
//! Inbound: newline-delimited JSON-RPC 2.0 records on stdin. Outbound: a
//! signed `POST {base}/mcp` per call, buffered or streamed, with the
//! translated response written back to stdout. See the module docs for the
//! individual pieces: [`auth`] (credential + signer), [`http`] (signed
//! transport with retry), [`codec`] (framing), [`session`] (correlation
//! table), [`proxy`] (the orchestrator).

pub mod auth;
pub mod codec;
pub mod config;
pub mod http;
pub mod models;
pub mod proxy;
pub mod session;
