pub mod api;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod link;
pub mod pages;
pub mod protocol;
pub mod services;
pub mod state_machine;
