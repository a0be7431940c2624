pub mod config;
pub mod control;
pub mod messages;
pub mod motor;
pub mod nav;
pub mod runtime;
pub mod teleop;
