//! `siftmailctl`: a thin command-line client for the content-analysis
//! daemon (spec §6.6). Each subcommand is a single HTTP or UDP round trip —
//! no rule evaluation, scoring, or persistence logic lives here.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use siftmail_core::{FuzzyCmd, FuzzyRequest};

/// Command-line overrides for where the daemon lives, mirroring
/// `siftmaild`'s own `--listen-addr`/`--fuzzy-listen-addr` pair.
#[derive(Parser, Debug)]
#[command(name = "siftmailctl")]
#[command(about = "Command-line client for the siftmail content-analysis daemon")]
struct Args {
    /// Base URL of the daemon's task-ingress HTTP API.
    #[arg(long, env = "SIFTMAIL_SERVER", default_value = "http://127.0.0.1:11333")]
    server: String,

    /// Address of the daemon's fuzzy datagram listener.
    #[arg(long, env = "SIFTMAIL_FUZZY_ADDR", default_value = "127.0.0.1:11335")]
    fuzzy_addr: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scans a message and prints the per-symbol/per-metric verdict.
    Symbols {
        /// Path to the message to scan; reads stdin when omitted.
        file: Option<PathBuf>,
    },
    /// Learns a message as spam.
    LearnSpam {
        file: Option<PathBuf>,
        #[arg(long)]
        classifier: Option<String>,
    },
    /// Learns a message as ham.
    LearnHam {
        file: Option<PathBuf>,
        #[arg(long)]
        classifier: Option<String>,
    },
    /// Writes a fuzzy digest to the store.
    FuzzyAdd {
        /// 64-byte digest, hex-encoded.
        digest: String,
        #[arg(long, default_value_t = 1)]
        value: i32,
        #[arg(long, default_value_t = 0)]
        flag: u8,
    },
    /// Deletes a fuzzy digest from the store.
    FuzzyDel {
        /// 64-byte digest, hex-encoded.
        digest: String,
    },
    /// Prints per-statfile learn-revision counts for a classifier.
    Stat {
        #[arg(long)]
        classifier: Option<String>,
    },
    /// Prints daemon-wide counters (fuzzy checked/found, roll history size).
    Counters,
    /// Prints how long the daemon has been running.
    Uptime,
}

fn read_message(file: &Option<PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display())),
        None => {
            use std::io::Read;
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("reading stdin")?;
            Ok(buf)
        }
    }
}

async fn print_json(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding response body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("daemon replied with {status}");
    }
    Ok(())
}

async fn scan(client: &reqwest::Client, server: &str, route: &str, file: &Option<PathBuf>) -> Result<()> {
    let body = read_message(file)?;
    let resp = client
        .post(format!("{server}{route}"))
        .body(body)
        .send()
        .await
        .context("sending scan request")?;
    print_json(resp).await
}

async fn learn(client: &reqwest::Client, server: &str, route: &str, classifier: &Option<String>, file: &Option<PathBuf>) -> Result<()> {
    let body = read_message(file)?;
    let mut req = client.post(format!("{server}{route}")).body(body);
    if let Some(classifier) = classifier {
        req = req.query(&[("classifier", classifier)]);
    }
    let resp = req.send().await.context("sending learn request")?;
    print_json(resp).await
}

fn parse_digest(hex_str: &str) -> Result<[u8; 64]> {
    let bytes = hex::decode(hex_str).context("digest is not valid hex")?;
    if bytes.len() != 64 {
        bail!("digest must decode to 64 bytes, got {}", bytes.len());
    }
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

/// Sends one fuzzy datagram and decodes the 13-byte v2 reply (spec §4.5,
/// §6.2) — `{value: i32, flag: u8, prob: f32, tag: u32}`, all little-endian.
async fn fuzzy_roundtrip(addr: SocketAddr, req: FuzzyRequest) -> Result<()> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.context("binding fuzzy client socket")?;
    socket.connect(addr).await.context("connecting to fuzzy listener")?;
    socket.send(&req.to_bytes()).await.context("sending fuzzy datagram")?;

    let mut buf = [0u8; 32];
    let len = tokio::time::timeout(std::time::Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .context("waiting for fuzzy reply")?
        .context("receiving fuzzy reply")?;
    if len != 13 {
        bail!("unexpected fuzzy reply length {len}");
    }

    let value = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    let flag = buf[4];
    let prob = f32::from_le_bytes(buf[5..9].try_into().unwrap());
    let tag = u32::from_le_bytes(buf[9..13].try_into().unwrap());
    println!("{{\"value\":{value},\"flag\":{flag},\"prob\":{prob},\"tag\":{tag}}}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();

    match args.command {
        Command::Symbols { file } => scan(&client, &args.server, "/v1/symbols", &file).await,
        Command::LearnSpam { file, classifier } => learn(&client, &args.server, "/v1/learn/spam", &classifier, &file).await,
        Command::LearnHam { file, classifier } => learn(&client, &args.server, "/v1/learn/ham", &classifier, &file).await,
        Command::FuzzyAdd { digest, value, flag } => {
            let req = FuzzyRequest {
                version: 2,
                cmd: FuzzyCmd::Write,
                flag,
                value,
                tag: 0,
                digest: parse_digest(&digest)?,
                shingles: None,
            };
            fuzzy_roundtrip(args.fuzzy_addr, req).await
        }
        Command::FuzzyDel { digest } => {
            let req = FuzzyRequest {
                version: 2,
                cmd: FuzzyCmd::Del,
                flag: 0,
                value: 0,
                tag: 0,
                digest: parse_digest(&digest)?,
                shingles: None,
            };
            fuzzy_roundtrip(args.fuzzy_addr, req).await
        }
        Command::Stat { classifier } => {
            let mut req = client.get(format!("{}/v1/stat", args.server));
            if let Some(classifier) = &classifier {
                req = req.query(&[("classifier", classifier)]);
            }
            print_json(req.send().await.context("sending stat request")?).await
        }
        Command::Counters => print_json(client.get(format!("{}/v1/counters", args.server)).send().await.context("sending counters request")?).await,
        Command::Uptime => print_json(client.get(format!("{}/v1/uptime", args.server)).send().await.context("sending uptime request")?).await,
    }
}
