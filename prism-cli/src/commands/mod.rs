pub mod create;
pub mod ping;

pub use create::{run_create, CreateOptions};
pub use ping::run_ping;
