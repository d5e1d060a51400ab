pub mod account_writer;
pub mod event_reader;
