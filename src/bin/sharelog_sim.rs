//! Sharelog Simulator
//!
//! Writes ckpool-like sharelogs for exercising the relay locally. The round
//! directory follows the Bitcoin chain tip (tip + 1, hex) and a new sharelog is
//! started at a fixed interval.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_TIP_URL: &str = "https://mempool.space/api/blocks/tip/height";

/// Agent string with its vardiff and accept rate
const AGENTS: &[(&str, f64, f64)] = &[
    ("bitaxe/BM1370/v2.12.2", 1000.0, 0.70),
    ("bitaxe/BM1370/v2.12.0", 1000.0, 0.70),
    ("bitaxe/BM1368/v1.0.7", 512.0, 0.65),
    ("bitaxe/BM1397/v2.12.0", 1000.0, 0.70),
    ("cgminer/4.11.1", 6345.0, 0.75),
    ("whatsminer/v1.0", 43027.0, 0.80),
    ("NMAxe/v2.5.10", 200.0, 0.55),
    ("NerdQAxe++/BM1370/v1.0.35", 5072.0, 0.60),
];

const NONCE2_CHOICES: &[&str] = &[
    "1d00000000000000", "1b00000000000000", "1e00000000000000", "1c00000000000000",
    "6302000000000000", "f228000000000000", "683d000000000000", "7102000000000000",
    "ef0c000000000000", "6802000000000000", "bc39000000000000", "a93b000000000000",
];

const WORKER_NAMES: &[&str] = &[
    "timixx", "Alan", "Snafus", "Montagnole", "eufo", "BRM1", "binuts", "Durdur33",
    "heimrichdab", "Brucewayne", "Meier_Link", "nanoJ", "bitaxe", "worker", "NerdQaxe",
    "MoghRoith13",
];

/// Simulate ckpool sharelogs
#[derive(Debug, Parser)]
#[command(name = "sharelog-sim", version, about)]
struct Args {
    /// Root directory receiving one subdirectory per round
    #[arg(long, default_value = "./ckpool/logs")]
    base_dir: PathBuf,

    /// Chain tip height endpoint (plain-text height)
    #[arg(long, default_value = DEFAULT_TIP_URL)]
    tip_url: String,

    /// Use this tip height instead of polling the endpoint
    #[arg(long)]
    start_height: Option<u64>,

    /// Seconds between tip polls
    #[arg(long, default_value = "5")]
    poll_seconds: u64,

    /// Tip request timeout in seconds
    #[arg(long, default_value = "10")]
    http_timeout: u64,

    /// Average shares written per second
    #[arg(long, default_value = "3.5")]
    shares_per_sec: f64,

    /// Seconds before a new sharelog file is started
    #[arg(long, default_value = "60")]
    sharelog_interval_seconds: u64,

    /// Distinct miner IPs
    #[arg(long, default_value = "60")]
    users_ip: usize,

    #[arg(long, default_value = "1")]
    min_btc_per_ip: usize,
    #[arg(long, default_value = "3")]
    max_btc_per_ip: usize,

    #[arg(long, default_value = "1")]
    min_workers_per_btc: usize,
    #[arg(long, default_value = "3")]
    max_workers_per_btc: usize,

    /// Agents per (ip, address, worker)
    #[arg(long, default_value = "1")]
    min_agents_per_pair: usize,
    #[arg(long, default_value = "2")]
    max_agents_per_pair: usize,

    #[arg(long, default_value = "564466077000000")]
    clientid_start: u64,

    /// Fixed ntime (8 hex digits) instead of a random one per share
    #[arg(long)]
    fixed_ntime: Option<String>,

    #[arg(long, default_value = "63")]
    workinfoid_bits: u32,

    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this long (e.g. "10m"); runs until Ctrl-C otherwise
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
}

/// One simulated stratum connection
#[derive(Debug, Clone)]
struct Connection {
    clientid: u64,
    ip: String,
    btc_address: String,
    workername: String,
    agent: &'static str,
}

fn rand_hex(rng: &mut StdRng, len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rng.fill(&mut bytes[..]);
    let mut out = hex::encode(bytes);
    out.truncate(len);
    out
}

fn random_ipv4(rng: &mut StdRng) -> String {
    (0..4)
        .map(|_| rng.random_range(1..=254u8).to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn random_btc_address(rng: &mut StdRng) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let body: String = (0..50)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("bc1q{}", body)
}

fn random_worker(rng: &mut StdRng) -> String {
    let base = WORKER_NAMES.choose(rng).copied().unwrap_or("worker");
    if rng.random_bool(0.25) {
        format!("{}{}", base, rng.random_range(2..=9))
    } else {
        base.to_string()
    }
}

fn pick_count(rng: &mut StdRng, min: usize, max: usize) -> usize {
    rng.random_range(min..=max.max(min))
}

fn make_connections(rng: &mut StdRng, args: &Args) -> Vec<Connection> {
    let mut conns = Vec::new();
    let mut clientid = args.clientid_start;

    for _ in 0..args.users_ip {
        let ip = random_ipv4(rng);
        let btc_count = pick_count(rng, args.min_btc_per_ip, args.max_btc_per_ip);

        for _ in 0..btc_count {
            let btc = random_btc_address(rng);
            let worker_count = pick_count(rng, args.min_workers_per_btc, args.max_workers_per_btc);

            let mut used = HashSet::new();
            for _ in 0..worker_count {
                let mut worker = random_worker(rng);
                for _ in 0..10 {
                    if !used.contains(&worker) {
                        break;
                    }
                    worker = random_worker(rng);
                }
                used.insert(worker.clone());

                let agent_count = pick_count(rng, args.min_agents_per_pair, args.max_agents_per_pair);
                let agents: Vec<_> = AGENTS.choose_multiple(rng, agent_count).collect();
                for &(agent, _, _) in agents {
                    conns.push(Connection {
                        clientid,
                        ip: ip.clone(),
                        btc_address: btc.clone(),
                        workername: format!("{}.{}", btc, worker),
                        agent,
                    });
                    clientid += 1;
                }
            }
        }
    }

    conns
}

fn createdate_now() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{},{:09}", now.as_secs(), now.subsec_nanos())
}

fn make_share(rng: &mut StdRng, conn: &Connection, fixed_ntime: Option<&str>, workinfoid_bits: u32) -> Value {
    let (diff, accept_rate) = AGENTS
        .iter()
        .find(|(agent, _, _)| *agent == conn.agent)
        .map(|(_, diff, rate)| (*diff, *rate))
        .unwrap_or((1000.0, 0.7));

    let accepted = rng.random_bool(accept_rate);
    let sdiff = diff * rng.random_range(1.05..25.0);
    let bits = workinfoid_bits.clamp(1, 64);
    let workinfoid = rng.random::<u64>() >> (64 - bits);
    let ntime = fixed_ntime.map(str::to_string).unwrap_or_else(|| rand_hex(rng, 8));

    let mut share = json!({
        "workinfoid": workinfoid,
        "clientid": conn.clientid,
        "enonce1": rand_hex(rng, 8),
        "nonce2": NONCE2_CHOICES.choose(rng).copied().unwrap_or(NONCE2_CHOICES[0]),
        "nonce": rand_hex(rng, 8),
        "ntime": ntime,
        "diff": diff,
        "sdiff": sdiff,
        "hash": format!("0000000000{}", rand_hex(rng, 54)),
        "result": accepted,
        "errn": if accepted { 0 } else { 2 },
        "createdate": createdate_now(),
        "createby": "code",
        "createcode": "parse_submit",
        "createinet": "0.0.0.0:3333",
        "workername": conn.workername,
        "username": conn.btc_address,
        "address": conn.ip,
        "agent": conn.agent,
    });
    if !accepted {
        share["reject-reason"] = json!("Stale");
    }
    share
}

/// Chain tip tracking; the round being mined is tip + 1
struct TipSource {
    client: reqwest::Client,
    url: String,
}

impl TipSource {
    fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, url })
    }

    async fn height(&self) -> Result<u64> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse()
            .with_context(|| format!("unexpected tip response: {:?}", body))
    }
}

/// The sharelog currently being written
struct Sharelog {
    file: File,
    path: PathBuf,
    opened: Instant,
}

async fn open_sharelog(base_dir: &Path, round_height: u64, counter: u64) -> Result<Sharelog> {
    let dir = base_dir.join(format!("{:08x}", round_height));
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let prefix = format!("{:08x}", secs);
    let prefix = &prefix[prefix.len() - 8..];
    let path = dir.join(format!("{}{:08x}.sharelog", prefix, counter));

    let file = File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(Sharelog {
        file,
        path,
        opened: Instant::now(),
    })
}

fn validate_ntime(value: Option<&str>) -> Result<Option<String>> {
    let Some(value) = value.map(|v| v.trim().to_ascii_lowercase()) else {
        return Ok(None);
    };
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("--fixed-ntime must be 8 hex digits (e.g. 6968c772)");
    }
    Ok(Some(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let fixed_ntime = validate_ntime(args.fixed_ntime.as_deref())?;
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    let conns = make_connections(&mut rng, &args);
    if conns.is_empty() {
        bail!("no simulated connections; raise --users-ip");
    }

    let tips = TipSource::new(args.tip_url.clone(), Duration::from_secs(args.http_timeout))?;
    let period = Duration::from_secs_f64(1.0 / args.shares_per_sec.max(0.1));
    let rotate_every = Duration::from_secs(args.sharelog_interval_seconds.max(1));
    let poll_every = Duration::from_secs(args.poll_seconds.max(1));
    let deadline = args.duration.map(|d| Instant::now() + d);

    info!(
        base_dir = %args.base_dir.display(),
        shares_per_sec = args.shares_per_sec,
        sharelog_every = %humantime::format_duration(rotate_every),
        conns = conns.len(),
        "Simulator starting"
    );

    let mut tip = args.start_height;
    let mut round_height = tip.map(|t| t + 1);
    let mut last_poll: Option<Instant> = None;
    let mut counter = 0u64;
    let mut current: Option<Sharelog> = None;
    let mut written = 0u64;

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        if args.start_height.is_none() && last_poll.map_or(true, |t| t.elapsed() >= poll_every) {
            last_poll = Some(Instant::now());
            match tips.height().await {
                Ok(height) if Some(height) != tip => {
                    tip = Some(height);
                    round_height = Some(height + 1);
                    info!(tip = height, round = %format_args!("{:08x}", height + 1), "New tip");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Tip height fetch failed"),
            }
        }
        let Some(height) = round_height else {
            continue;
        };

        let needs_rotation = current.as_ref().map_or(true, |s| s.opened.elapsed() >= rotate_every);
        if needs_rotation {
            if let Some(mut old) = current.take() {
                old.file.flush().await?;
            }
            let log = open_sharelog(&args.base_dir, height, counter).await?;
            counter += 1;
            info!(file = %log.path.display(), "New sharelog");
            current = Some(log);
        }

        let Some(log) = current.as_mut() else {
            continue;
        };
        let Some(conn) = conns.choose(&mut rng) else {
            continue;
        };
        let share = make_share(&mut rng, conn, fixed_ntime.as_deref(), args.workinfoid_bits);
        let mut line = serde_json::to_vec(&share)?;
        line.push(b'\n');
        log.file.write_all(&line).await?;
        log.file.flush().await?;
        written += 1;
    }

    if let Some(mut log) = current {
        log.file.flush().await?;
    }
    info!(written, "Simulator stopped");
    Ok(())
}
