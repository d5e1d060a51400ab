pub mod csv;
pub mod http;
pub mod messaging;
pub mod replay;
