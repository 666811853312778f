//! Provider client: registers a local file with a bridge, opens the stream
//! connection, handshakes, and pushes the file's bytes. The bridge forwards
//! them to whoever fetches the download URL; this process must stay alive
//! until that download finishes.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

use streambridge_protocol::{
    RegisterRequest, RegisterResponse, StreamHello, STREAM_READY,
};

const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "streambridge-provider",
    version,
    about = "Publish a local file through a streambridge bridge"
)]
struct Cli {
    /// Base URL of the bridge, e.g. http://localhost:8000
    bridge: String,
    /// File to publish
    file: PathBuf,
    /// HTTP timeout towards the bridge, in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let metadata = tokio::fs::metadata(&cli.file)
        .await
        .with_context(|| format!("cannot stat {}", cli.file.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a regular file", cli.file.display());
    }
    let filename = file_name_of(&cli.file)?;
    let size = metadata.len();

    let registration = register(&cli, &filename, size).await?;
    println!("download url: {}", registration.download_url);
    println!(
        "file: {} ({})",
        registration.original_filename,
        human_size(size)
    );
    println!("the link is single-use and expires at {}", registration.expires_at);

    let (sent, elapsed) = stream_file(&registration, &cli.file).await?;
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        sent as f64 / secs / 1024.0
    } else {
        0.0
    };
    info!(bytes = sent, secs, kib_per_s = rate, "transfer complete");
    println!("done: {} sent in {:.2}s", human_size(sent), secs);
    Ok(())
}

async fn register(cli: &Cli, filename: &str, size: u64) -> Result<RegisterResponse> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.timeout))
        .build()
        .context("http client setup failed")?;
    let base = cli.bridge.trim_end_matches('/');

    let response = client
        .post(format!("{base}/register"))
        .json(&RegisterRequest {
            filename: filename.to_string(),
            size,
        })
        .send()
        .await
        .with_context(|| format!("register call to {base} failed"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("registration rejected: {status} {body}");
    }
    response
        .json::<RegisterResponse>()
        .await
        .context("register response was not valid JSON")
}

/// Open the stream connection, handshake, and push the file.
async fn stream_file(
    registration: &RegisterResponse,
    path: &Path,
) -> Result<(u64, Duration)> {
    let endpoint = format!(
        "{}:{}",
        host_only(&registration.tcp_endpoint.host),
        registration.tcp_endpoint.port
    );
    info!(endpoint = %endpoint, "connecting stream");
    let conn = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&endpoint))
        .await
        .with_context(|| format!("connect to {endpoint} timed out"))?
        .with_context(|| format!("connect to {endpoint} failed"))?;
    let (read_half, mut write_half) = conn.into_split();

    let hello = serde_json::to_string(&StreamHello {
        auth_token: registration.auth_token.clone(),
        filename: Some(registration.original_filename.clone()),
    })?;
    write_half.write_all(hello.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let mut reader = BufReader::new(read_half);
    let mut reply = String::new();
    reader
        .read_line(&mut reply)
        .await
        .context("no handshake reply from the bridge")?;
    if reply.trim() != STREAM_READY {
        bail!("bridge refused the stream: {}", reply.trim());
    }
    info!("stream tunnel established, sending file");

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let started = Instant::now();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_half
            .write_all(&buf[..n])
            .await
            .context("bridge connection dropped mid-transfer")?;
        sent += n as u64;
    }
    // Half-close the write side; the bridge reads this as end-of-file.
    write_half.shutdown().await?;
    Ok((sent, started.elapsed()))
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .with_context(|| format!("{} has no file name", path.display()))
}

/// Some bridges echo `host:port` in the endpoint host; keep only the host.
fn host_only(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() => name,
        _ => host,
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}
