//! CLI entrypoint for icmprobe.

use clap::{Parser, Subcommand};
use icmprobe_common::{
    convert_duration_to_ms, next_session_id, CancellationToken, IpFamily, ProbeError, ProbeResult,
    ReplyOutcome, DEFAULT_MAX_HOPS, DEFAULT_PING_COUNT, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_PING_TIMEOUT_MS, DEFAULT_PROBES_PER_HOP, DEFAULT_TRACE_TIMEOUT_MS,
};
use icmprobe_packets::{RawIcmpTransport, ECHO_DATAGRAM_LEN, ICMP_HEADER_LEN};
use icmprobe_ping::{PingConfig, PingSession};
use icmprobe_probe::{PacketMode, ProbeSequencer};
use icmprobe_traceroute::{HopRecord, TracerouteConfig, TracerouteSession};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::process;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "icmprobe")]
#[command(about = "ICMP echo diagnostics: ping and traceroute", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enables debug logging (RUST_LOG overrides the level).
    #[arg(short = 'v', long = "verbose", global = true, default_value_t = false)]
    verbose: bool,

    /// Emits the session report as JSON instead of text.
    #[arg(long = "json", global = true, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Repeatedly probes a host and reports round-trip statistics.
    Ping {
        #[arg(value_name = "target")]
        target: String,

        /// Number of probes; 0 runs until interrupted.
        #[arg(short = 'c', long = "count", default_value_t = DEFAULT_PING_COUNT)]
        count: u64,

        /// No pause between probes.
        #[arg(short = 'f', long = "flood", default_value_t = false)]
        flood: bool,

        /// Pause between probes in milliseconds.
        #[arg(short = 'i', long = "interval", default_value_t = DEFAULT_PING_INTERVAL_MS)]
        interval_ms: u64,

        /// Per-probe reply window in milliseconds.
        #[arg(long = "timeout", default_value_t = DEFAULT_PING_TIMEOUT_MS)]
        timeout_ms: u64,

        /// Prefer IPv6 when the target resolves to both families.
        #[arg(long = "ipv6", default_value_t = false)]
        ipv6: bool,
    },
    /// Discovers the route to a host hop by hop.
    Trace {
        #[arg(value_name = "target")]
        target: String,

        #[arg(short = 'm', long = "max-hops", default_value_t = DEFAULT_MAX_HOPS)]
        max_hops: u8,

        #[arg(short = 'q', long = "probes-per-hop", default_value_t = DEFAULT_PROBES_PER_HOP)]
        probes_per_hop: usize,

        /// Per-probe reply window in milliseconds.
        #[arg(long = "timeout", default_value_t = DEFAULT_TRACE_TIMEOUT_MS)]
        timeout_ms: u64,

        /// Prefer IPv6 when the target resolves to both families.
        #[arg(long = "ipv6", default_value_t = false)]
        ipv6: bool,

        /// Builds the IPv4 header in userspace instead of letting the
        /// kernel do it. IPv4 only.
        #[arg(long = "header-include", default_value_t = false)]
        header_include: bool,
    },
}

static CANCEL: OnceLock<CancellationToken> = OnceLock::new();

extern "C" fn on_sigint(_signum: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

fn install_sigint(token: CancellationToken) {
    if CANCEL.set(token).is_err() {
        return;
    }
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves a hostname or literal address, preferring the requested
/// family but falling back to whatever the resolver returns.
fn resolve_target(host: &str, want_v6: bool) -> Result<IpAddr, ProbeError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|err| ProbeError::InvalidAddress(format!("{}: {}", host, err)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == want_v6)
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeError::InvalidAddress(format!("{}: no addresses", host)))
}

/// Finds the local IPv4 address the kernel would route toward the
/// target; header-include datagrams need it as their source.
fn local_ipv4_for_target(target: Ipv4Addr) -> Result<Ipv4Addr, ProbeError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|err| ProbeError::Internal(format!("failed to bind probe socket: {}", err)))?;
    socket
        .connect((target, 33434))
        .map_err(|err| ProbeError::Internal(format!("no route to {}: {}", target, err)))?;
    match socket
        .local_addr()
        .map_err(|err| ProbeError::Internal(err.to_string()))?
    {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(ProbeError::Internal(
            "IPv4 socket returned an IPv6 local address".to_string(),
        )),
    }
}

fn open_sequencer(
    target: IpAddr,
    timeout: Duration,
    header_include: bool,
) -> Result<ProbeSequencer, ProbeError> {
    let family = IpFamily::of(target);
    let transport = RawIcmpTransport::open(family, header_include)?;
    let mode = if header_include {
        match target {
            IpAddr::V4(dst) => PacketMode::HeaderIncluded {
                src: local_ipv4_for_target(dst)?,
            },
            IpAddr::V6(_) => return Err(ProbeError::Unsupported("IPv6 header-include mode")),
        }
    } else {
        PacketMode::Kernel
    };
    ProbeSequencer::new(Box::new(transport), target, next_session_id(), mode, timeout)
}

fn print_probe_line(result: &ProbeResult) {
    match &result.outcome {
        ReplyOutcome::EchoReply { source, rtt } => {
            println!(
                "{} bytes from {}: icmp_seq={} time={:.3} ms",
                ECHO_DATAGRAM_LEN - ICMP_HEADER_LEN,
                source,
                result.ident.seq,
                convert_duration_to_ms(*rtt)
            );
        }
        ReplyOutcome::TimeExceeded { source, .. } => {
            println!(
                "Time to live exceeded from {}: icmp_seq={}",
                source, result.ident.seq
            );
        }
        ReplyOutcome::Timeout | ReplyOutcome::Unrecognized => {
            println!("Request timeout for icmp_seq {}", result.ident.seq);
        }
        ReplyOutcome::TransportError(err) => {
            println!("icmp_seq={}: {}", result.ident.seq, err);
        }
    }
}

fn print_hop_line(hop: &HopRecord) {
    match hop.responder {
        Some(addr) => {
            let rtt = hop
                .best_rtt()
                .map(|rtt| format!("  {:.3} ms", convert_duration_to_ms(rtt)))
                .unwrap_or_default();
            println!("{:>2}  {}{}", hop.ttl, addr, rtt);
        }
        None => println!("{:>2}  *", hop.ttl),
    }
}

fn run_ping(
    target: IpAddr,
    config: PingConfig,
    timeout: Duration,
    json: bool,
) -> Result<(), ProbeError> {
    let flood = config.flood;
    let sequencer = open_sequencer(target, timeout, false)?;
    let mut session = PingSession::new(sequencer, target, config);

    let cancel = CancellationToken::default();
    install_sigint(cancel.clone());

    if !json {
        println!(
            "PING {}: {} data bytes",
            target,
            ECHO_DATAGRAM_LEN - ICMP_HEADER_LEN
        );
    }
    let stats = session.run(&cancel, |result| {
        if json {
            return;
        }
        if flood {
            print!(".");
            let _ = std::io::stdout().flush();
        } else {
            print_probe_line(result);
        }
    });

    if json {
        let report = stats.to_report(target);
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|err| ProbeError::Internal(err.to_string()))?
        );
        return Ok(());
    }

    if flood {
        println!();
    }
    println!();
    println!("--- {} ping statistics ---", target);
    println!(
        "{} packets transmitted, {} packets received, {:.1}% packet loss",
        stats.transmitted,
        stats.received,
        stats.loss_percent()
    );
    if let (Some(min), Some(avg), Some(max)) = (stats.rtt_min, stats.rtt_avg(), stats.rtt_max) {
        println!(
            "round-trip min/avg/max = {:.3}/{:.3}/{:.3} ms",
            convert_duration_to_ms(min),
            convert_duration_to_ms(avg),
            convert_duration_to_ms(max)
        );
    }
    Ok(())
}

fn run_trace(
    target: IpAddr,
    config: TracerouteConfig,
    timeout: Duration,
    header_include: bool,
    json: bool,
) -> Result<(), ProbeError> {
    let sequencer = open_sequencer(target, timeout, header_include)?;
    let mut session = TracerouteSession::new(sequencer, target, config.clone());

    let cancel = CancellationToken::default();
    install_sigint(cancel.clone());

    if !json {
        println!("traceroute to {}, {} hops max", target, config.max_hops);
    }
    let outcome = session.run(&cancel, |hop| {
        if !json {
            print_hop_line(hop);
        }
    });

    if json {
        let report = outcome.to_report(target);
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|err| ProbeError::Internal(err.to_string()))?
        );
    } else if !outcome.reached {
        println!("destination not reached within {} hops", config.max_hops);
    }
    Ok(())
}

fn run(args: Args) -> Result<(), ProbeError> {
    match args.command {
        Command::Ping {
            target,
            count,
            flood,
            interval_ms,
            timeout_ms,
            ipv6,
        } => {
            let target = resolve_target(&target, ipv6)?;
            let config = PingConfig {
                count: (count > 0).then_some(count),
                flood,
                interval: Duration::from_millis(interval_ms),
            };
            run_ping(target, config, Duration::from_millis(timeout_ms), args.json)
        }
        Command::Trace {
            target,
            max_hops,
            probes_per_hop,
            timeout_ms,
            ipv6,
            header_include,
        } => {
            let target = resolve_target(&target, ipv6)?;
            let config = TracerouteConfig {
                max_hops,
                probes_per_hop,
            };
            run_trace(
                target,
                config,
                Duration::from_millis(timeout_ms),
                header_include,
                args.json,
            )
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args) {
        eprintln!("icmprobe: {}", err);
        if matches!(err, ProbeError::PermissionDenied(_)) {
            eprintln!("raw ICMP sockets require root or CAP_NET_RAW");
        }
        process::exit(1);
    }
}
