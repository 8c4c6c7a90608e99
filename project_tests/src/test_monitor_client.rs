use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Simulated signage monitor", long_about = None)]
struct Args {
    /// WebSocket endpoint of the schedule server
    #[clap(short, long, default_value = "ws://127.0.0.1:9003/ws")]
    url: String,

    /// Identity token sent in register_monitor
    #[clap(short, long)]
    token: String,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

fn describe(event: &str, data: &Value) -> String {
    match event {
        "init_schedules" => format!("{} schedule(s) for today", data.as_array().map_or(0, Vec::len)),
        "schedule_update" => format!(
            "schedule {} -> content {}",
            data["id"], data["contentId"]
        ),
        "show" => format!(
            "content {} from schedule {} until {}",
            data["contentId"], data["assignmentId"], data["endsAt"]
        ),
        "error" => format!("server error {}", data),
        other => format!("unexpected event '{other}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    println!("Connected to {}", args.url);
    let (mut write, mut read) = ws_stream.split();

    let register = json!({ "event": "register_monitor", "data": { "token": args.token } });
    write.send(Message::Text(register.to_string().into())).await?;

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut report = interval(Duration::from_secs(args.report_interval_seconds.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(reason))) => {
                        println!("Server closed the connection: {:?}", reason);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => bail!("socket error: {e}"),
                    None => break,
                };
                let frame: Value = match serde_json::from_str(text.as_str()) {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("Unparseable frame ({e}): {}", text.as_str());
                        continue;
                    }
                };
                let event = frame["event"].as_str().unwrap_or("<none>").to_string();
                println!("[{}] {:<16} {}", Local::now().format("%H:%M:%S"), event, describe(&event, &frame["data"]));
                *counts.entry(event.clone()).or_default() += 1;
                if event == "error" {
                    break;
                }
            }
            _ = report.tick() => {
                println!("--- {} ---", Local::now().format("%Y-%m-%d %H:%M:%S"));
                for (event, count) in &counts {
                    println!("{:<16} {}", event, count);
                }
            }
        }
    }

    println!("Session ended. Totals: {:?}", counts);
    Ok(())
}
