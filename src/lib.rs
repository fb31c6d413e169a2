pub mod apps;
pub mod config;
pub mod dispatch;
pub mod hello_world;
pub mod logger;
pub mod schema;
pub mod workflow;
