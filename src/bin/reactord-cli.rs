//! Command-line client for reactord.

use clap::{Parser, Subcommand};
use reactord::protocol::command::{ECHO, TIME};
use reactord::protocol::Client;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "reactord-cli")]
#[command(version = "0.1.0")]
#[command(about = "Send requests to a reactord server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:12200")]
    addr: SocketAddr,

    /// Reply timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Request,
}

#[derive(Subcommand, Debug)]
enum Request {
    /// Echo a message back
    Echo {
        message: String,
        /// Send the request this many times, pipelined
        #[arg(short, long, default_value_t = 1)]
        repeat: usize,
    },
    /// Ask for the server time
    Time,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut client = Client::connect(args.addr)?;
    client.set_timeout(Some(Duration::from_millis(args.timeout_ms)))?;

    match args.command {
        Request::Echo { message, repeat } => {
            for _ in 0..repeat {
                client.send(ECHO, message.as_bytes())?;
            }
            for _ in 0..repeat {
                print_reply(&client.recv()?);
            }
        }
        Request::Time => print_reply(&client.call(TIME, &[])?),
    }

    Ok(())
}

fn print_reply(reply: &reactord::protocol::Response) {
    if reply.is_success() {
        println!("{}", String::from_utf8_lossy(&reply.body));
    } else {
        eprintln!("error code {}: {}", reply.code, String::from_utf8_lossy(&reply.body));
    }
}
