//! Command-line interface

mod args;

pub use args::{AttachArgs, Cli, Command, OutputFormat, DEFAULT_OBJECT_PATH};
