pub mod error;
pub mod openai;
pub mod store;
