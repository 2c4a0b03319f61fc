pub mod config;
pub mod events;
pub mod images;
pub mod lifecycle;
pub mod orchestrator;
pub mod precheck;
pub mod profile;
pub mod store;
pub mod terminal;
pub mod transport;
