//! Command line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Demo agent
#[derive(Parser, Debug)]
#[command(
    name = "agentwire-demo",
    version,
    about = "Send requests and dispatch events through an agentwire router"
)]
pub(crate) struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub(crate) command: Command,

    /// Configuration file (.toml, .yaml or .json)
    #[arg(long, short = 'c', global = true, env = "AGENTWIRE_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Agent identity, overriding the configuration file
    #[arg(long, global = true, env = "AGENTWIRE_IDENTITY")]
    pub(crate) identity: Option<String>,

    /// Router URL; repeat for several routers
    #[arg(long = "router", short = 'r', global = true)]
    pub(crate) routers: Vec<String>,

    /// API version sent to the router
    #[arg(long, global = true, default_value = "2.0")]
    pub(crate) api_version: String,

    /// Log at debug level
    #[arg(long, short = 'v', global = true)]
    pub(crate) verbose: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Send a request and print the reply
    Request(SendArgs),

    /// Send a push
    Push(SendArgs),

    /// Keep resending a request until it succeeds or times out
    Retry {
        #[command(flatten)]
        send: SendArgs,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Listen for events and dispatch them to the built-in actors
    Serve {
        /// Routing keys to subscribe to
        #[arg(long = "routing-key")]
        routing_keys: Vec<String>,

        /// Listen by long-polling only
        #[arg(long)]
        long_poll: bool,
    },
}

#[derive(Args, Debug)]
pub(crate) struct SendArgs {
    /// Type of the request, e.g. /foo/bar
    #[arg(value_name = "TYPE")]
    pub(crate) type_: String,

    /// JSON payload
    #[arg(long, short = 'p', default_value = "{}")]
    pub(crate) payload: String,

    /// Identity of the agent to send to
    #[arg(long, short = 't')]
    pub(crate) target: Option<String>,

    /// Time-to-live in seconds
    #[arg(long)]
    pub(crate) ttl: Option<u64>,
}
