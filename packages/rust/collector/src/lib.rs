//! Page agents and per-site record collection.
//!
//! This crate provides:
//! - [`PageAgent`]: the page-rendering capability the engine drives
//! - [`HttpPageAgent`]: a static-HTML agent over `reqwest` + `scraper`
//! - [`TimeoutAgent`]: bounds every agent call with a time budget
//! - [`SiteCollector`]: open, extract, paginate and close one site

pub mod agent;
pub mod collector;
pub mod http;

pub use agent::{OpenOptions, PageAgent, PageContent, PageHandle, TimeoutAgent};
pub use collector::{CollectionReport, SiteCollector};
pub use http::HttpPageAgent;
