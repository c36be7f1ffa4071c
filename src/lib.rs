// tunproxy library crate
//
// The proxy core only needs a `dial::Dial` implementation; tunnel transports
// plug in there. The binary wires it to `dial::DirectDialer`.

pub mod cli;
pub mod config;
pub mod dial;
pub mod error;
pub mod logging;
pub mod proxy;
