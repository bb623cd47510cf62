pub mod comms;
pub mod data;
pub mod engine;
pub mod ids;
pub mod ledger;
pub mod wire;
