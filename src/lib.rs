#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod daemon;
pub mod mail;
pub(crate) mod util;

pub use config::Config;

/// Mail subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MailCommands {
    /// Drop a message into the spool for the daemon to deliver
    Send {
        /// Sender address
        #[arg(long)]
        from: String,
        /// Recipient address, a session path such as refinery/crew/max
        #[arg(long)]
        to: String,
        /// Subject line
        #[arg(long)]
        subject: String,
        /// Message body
        #[arg(long, default_value = "")]
        body: String,
        /// Priority: low, normal, high, urgent
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Deliver as a session interrupt instead of a passive notification
        #[arg(long)]
        interrupt: bool,
    },
    /// Show persisted queue sizes
    Queues,
}
