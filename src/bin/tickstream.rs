use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tickstream::{Client, StreamEnd};

#[derive(Parser)]
#[command(name = "tickstream")]
#[command(version)]
#[command(about = "Subscribe to a time-series data service and print updates")]
pub struct Cli {
    /// Service base endpoint
    #[arg(short, long, default_value = "http://localhost:5993")]
    pub endpoint: String,

    /// Streams to subscribe to (can be specified multiple times)
    #[arg(short, long, required = true)]
    pub stream: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let client = match Client::new(&cli.endpoint) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let handle = match client
        .subscribe(
            |payload| {
                println!("{}: {:?}", payload.key, payload.data);
                Ok(())
            },
            cancel.clone(),
            cli.stream,
        )
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match handle.done().await {
        StreamEnd::Cancelled => ExitCode::SUCCESS,
        StreamEnd::ConnectionClosed => {
            eprintln!("stream closed by server");
            ExitCode::FAILURE
        }
    }
}
