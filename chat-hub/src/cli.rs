use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::server::DEFAULT_OUTBOUND_BUFFER;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat hub, serving WebSocket clients on `/ws`.
    Serve(ServeArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the HTTP listener binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Messages queued per connection before broadcasts wait on a slow reader.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket endpoint of the hub.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    /// Display name; the hub assigns a guest name when omitted.
    #[arg(long)]
    pub username: Option<String>,
}
