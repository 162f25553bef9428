pub mod analysis_test;
pub mod chat_test;
pub mod client_test;
pub mod common;
pub mod http_test;
pub mod postgres_test;
