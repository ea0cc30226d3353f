pub mod config;
pub mod fields;
pub mod logging;
pub mod request;
pub mod search;
pub mod storage;
