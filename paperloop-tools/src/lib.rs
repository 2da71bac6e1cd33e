//! # Paperloop Tools
//!
//! Paper-index clients for paperloop: the rate-limited arXiv fetcher, its
//! HTTP transport, the process-wide request gate, and the Atom feed parser.

pub mod arxiv;
pub mod atom;
pub mod rate_limit;

pub use arxiv::{ArxivClient, HttpResponse, HttpTransport, ReqwestTransport, validate_arxiv_id};
pub use atom::{AtomFeed, parse_entry, parse_feed};
pub use rate_limit::RequestGate;
