// folio-relay: y-websocket collaboration server with PostgreSQL snapshot
// persistence.

pub mod app;
pub mod coalesce;
pub mod config;
pub mod db;
pub mod gateway;
pub mod session;
pub mod store;
