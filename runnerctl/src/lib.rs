pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod event;
pub mod instance;
pub mod providers;
pub mod secrets;
pub mod server;
pub mod signature;
