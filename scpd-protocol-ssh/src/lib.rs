mod keys;
pub mod scp;
mod server;
mod sftp;

pub use keys::{generate_host_keys, load_host_keys};
pub use server::{run_server, ServerHandler};
