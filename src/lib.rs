pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod events;
pub mod filters;
pub mod future;
pub mod futures_db;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod message;
pub mod permissions;
pub mod permissions_db;
pub mod rpc;
pub mod shutdown;
pub mod sync;
pub mod url;
pub mod workspace;
