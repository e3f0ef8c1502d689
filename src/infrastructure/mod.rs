pub mod config;
pub mod error;
pub mod export_parser;
pub mod logging;
pub mod tag_history;
pub mod tracker_gateway;
