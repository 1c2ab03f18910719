pub mod commands;

pub use commands::{build_cli, build_sink, handle_subcommands, init_logging, load_config, needs_config};
