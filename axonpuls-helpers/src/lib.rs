pub mod env;
pub mod gateway;
pub mod http_types;
pub mod ids;
pub mod redis;
pub mod retries;
pub mod testing;
pub mod time;
