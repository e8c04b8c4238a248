//! The routing fabric: Broker + Switchboard, Worker TaskManager, and
//! Client Multiplexor, plus the gRPC wire encoding connecting them.
//! `main.rs` is a thin CLI shell over this library.

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod grpc;
pub mod signals;
pub mod worker;
