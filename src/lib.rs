pub mod catalog;
pub mod connections;
pub mod core;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod oauth;
pub mod settings;
pub mod store;
pub mod sync;
pub mod upstream;
pub mod vault;

pub static CLIENT_NAME: &str = "bursar";
