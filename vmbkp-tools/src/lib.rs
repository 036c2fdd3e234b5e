pub mod fs;
pub mod lock;
pub mod nom;

mod command;
pub use command::run_command_logged;
