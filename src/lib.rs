pub mod config;
pub mod error;
pub mod fetch;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod store;
