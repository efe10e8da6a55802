//! Firehose subscriber CLI.
//!
//! Connects to a node's `com.atproto.sync.subscribeRepos` endpoint and
//! prints one line per event. Useful for watching a repository live and for
//! debugging frame encoding.

use clap::Parser;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use weft_common::codec::Value;
use weft_pds::firehose::parse_frame;

#[derive(Debug, Parser)]
#[command(name = "firehose-tail", about = "Tail a weft PDS firehose")]
struct Args {
    /// Node origin, e.g. https://blog.example or http://127.0.0.1:3030
    #[arg(long)]
    url: String,

    /// Override the port in the origin
    #[arg(long)]
    port: Option<u16>,

    /// Resume from this sequence number (exclusive)
    #[arg(long)]
    cursor: Option<i64>,
}

#[tokio::main]
async fn main() {
    // clap exits 1 by itself when --url is missing
    let args = Args::parse();

    let mut url = match url::Url::parse(&args.url) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("invalid --url: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        if url.set_port(Some(port)).is_err() {
            eprintln!("cannot apply --port to {url}");
            std::process::exit(1);
        }
    }
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    if url.set_scheme(scheme).is_err() {
        eprintln!("cannot derive websocket scheme from {url}");
        std::process::exit(1);
    }
    url.set_path("/xrpc/com.atproto.sync.subscribeRepos");
    if let Some(cursor) = args.cursor {
        url.set_query(Some(&format!("cursor={cursor}")));
    }

    eprintln!("connecting to {url}");
    let (stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            eprintln!("connect failed: {e}");
            std::process::exit(1);
        }
    };
    let (_, mut read) = stream.split();

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Binary(frame)) => match parse_frame(&frame) {
                Ok((header, body)) => print_event(&header, &body),
                Err(e) => eprintln!("bad frame: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    eprintln!("stream closed");
}

fn print_event(header: &Value, body: &Value) {
    let kind = header
        .as_map()
        .and_then(|m| m.get_str("t"))
        .unwrap_or("?");
    let Some(body) = body.as_map() else {
        println!("{kind} (malformed body)");
        return;
    };
    let seq = body.get("seq").and_then(Value::as_integer).unwrap_or(-1);
    match kind {
        "#commit" => {
            let rev = body.get_str("rev").unwrap_or("?");
            let ops = match body.get("ops") {
                Some(Value::Array(ops)) => ops
                    .iter()
                    .filter_map(Value::as_map)
                    .map(|op| {
                        format!(
                            "{} {}",
                            op.get_str("action").unwrap_or("?"),
                            op.get_str("path").unwrap_or("?")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => String::new(),
            };
            println!("{seq} #commit rev={rev} [{ops}]");
        }
        "#identity" => {
            println!("{seq} #identity handle={}", body.get_str("handle").unwrap_or("?"));
        }
        "#account" => {
            let active = matches!(body.get("active"), Some(Value::Boolean(true)));
            println!("{seq} #account active={active}");
        }
        other => println!("{seq} {other}"),
    }
}
