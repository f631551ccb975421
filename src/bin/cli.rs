//! ShardKV CLI Client
//!
//! Command-line interface for interacting with ShardKV.

use std::time::Duration;

use clap::Parser;
use shardkv::network::Client;
use shardkv::protocol::{Command, Response, Value};

/// ShardKV CLI
#[derive(Parser, Debug)]
#[command(name = "shardkv-cli")]
#[command(about = "CLI for the ShardKV key-value server")]
#[command(version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7379")]
    server: String,

    /// AUTH password sent before the command
    #[arg(short = 'a', long)]
    auth: Option<String>,

    /// Keep the connection open and print watch pushes (use with X.WATCH)
    #[arg(short, long)]
    watch: bool,

    /// Tag a .WATCH command with a fresh UUID label
    #[arg(short, long)]
    label: bool,

    /// Command name, e.g. GET, MSET, GET.WATCH
    command: String,

    /// Command arguments
    args: Vec<String>,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("(error) {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> shardkv::Result<()> {
    let mut client = Client::connect(&args.server)?;

    if let Some(pass) = &args.auth {
        if let Response::Error(e) = client.execute(Command::new("AUTH", [pass.as_str()]))? {
            eprintln!("(error) {}", e);
            std::process::exit(1);
        }
    }

    let name = args.command.to_ascii_uppercase();
    let mut command_args = args.args;
    if args.label && name.ends_with(".WATCH") {
        command_args.push(uuid::Uuid::new_v4().to_string());
    }
    let command = Command::new(name, command_args);
    let response = client.execute(command)?;
    println!("{}", render(&response));

    if args.watch {
        loop {
            if let Some(push) = client.next_push(Duration::from_secs(1))? {
                println!("{}", render(&push));
            }
        }
    }
    Ok(())
}

fn render(response: &Response) -> String {
    match response {
        Response::Reply(value) => render_value(value, 0),
        Response::Error(e) => format!("(error) {}", e),
        Response::Push {
            label,
            fingerprint,
            result,
        } => match result {
            Ok(value) => format!("[{} {}] {}", label, fingerprint, render_value(value, 0)),
            Err(e) => format!("[{} {}] (error) {}", label, fingerprint, e),
        },
    }
}

fn render_value(value: &Value, depth: usize) -> String {
    match value {
        Value::Nil => "(nil)".to_string(),
        Value::Ok => "OK".to_string(),
        Value::Int(n) => format!("(integer) {}", n),
        Value::Str(s) => format!("\"{}\"", s),
        Value::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}{}) {}", "   ".repeat(depth), i + 1, render_value(v, depth + 1)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
