pub mod account;
pub mod event;
pub mod ledger;
pub mod ports;
pub mod task;
pub mod user;
