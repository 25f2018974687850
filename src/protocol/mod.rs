pub mod codec;
pub mod mapper;
pub mod schema;
pub mod type_key;
