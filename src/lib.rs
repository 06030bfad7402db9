pub mod backend;
pub mod budget;
pub mod classify;
pub mod config;
pub mod event;
pub mod feed;
pub mod logging;
pub mod router;
pub mod timing;
pub mod worker;
