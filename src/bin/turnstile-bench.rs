//! Burst load generator for a running Turnstile gateway.
//!
//! Fires a burst of concurrent requests per scenario and prints how many of
//! each status code came back.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::future::join_all;
use turnstile::http::API_KEY_HEADER;

#[derive(Debug, Parser)]
#[command(name = "turnstile-bench", about = "Send request bursts through a Turnstile gateway")]
struct Args {
    /// Gateway URL
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Requests per scenario, all sent at once
    #[arg(short = 'n', long, default_value_t = 500)]
    requests: usize,

    /// Pause between scenarios so windows and blocks expire
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pause: Duration,
}

/// Scenario title and the token it sends, if any.
const SCENARIOS: &[(&str, Option<&str>)] = &[
    ("No token", None),
    ("Token level 1", Some("1234")),
    ("Token level 2", Some("2234")),
    ("Token level 3", Some("3234")),
    ("Token level 4", Some("4234")),
    ("Token fail", Some("5234")),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    for (title, token) in SCENARIOS {
        let (statuses, elapsed) = burst(&client, &args.url, *token, args.requests).await;

        println!("{}", title);
        println!("Qt requests: {} by second", args.requests);
        println!("Status code:\tQt Resp");
        for (status, count) in &statuses {
            println!("{}:\t\t{}", status, count);
        }
        println!("Time elapsed: {:?}\n", elapsed);

        tokio::time::sleep(args.pause).await;
    }

    Ok(())
}

/// Send `count` concurrent GETs and tally the responses by status.
///
/// Transport failures are tallied under `error`.
async fn burst(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    count: usize,
) -> (BTreeMap<String, usize>, Duration) {
    let start = Instant::now();

    let requests = (0..count).map(|_| {
        let mut request = client.get(url);
        if let Some(token) = token {
            request = request.header(API_KEY_HEADER, token);
        }
        async move {
            match request.send().await {
                Ok(response) => response.status().as_u16().to_string(),
                Err(e) => {
                    eprintln!("request failed: {}", e);
                    "error".to_string()
                }
            }
        }
    });

    let mut statuses = BTreeMap::new();
    for status in join_all(requests).await {
        *statuses.entry(status).or_insert(0) += 1;
    }

    (statuses, start.elapsed())
}
