pub mod app;
pub mod call;
pub mod config;
pub mod handler;
pub mod net_tool;
pub mod useragent;
pub mod version;
