use std::net::IpAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "parley-relay")]
#[command(about = "Parley signaling relay server")]
pub struct Cli {
    /// Port to listen on (overrides PARLEY_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,
}
