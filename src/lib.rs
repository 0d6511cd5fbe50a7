pub mod config;
pub mod config_node;
pub mod constraint;
pub mod database;
pub mod flow_commands;
pub mod logger;
pub mod migration;
pub mod node;
pub mod nodes;
pub mod path;
pub mod payload;
pub mod property;
pub mod schema;
pub mod state;

pub use node_plugin::message;
