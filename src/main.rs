// Command line front end: polls one Modbus TCP device until stopped
use std::io::{BufRead, BufReader};
use std::str::FromStr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;
use modbus_poller::{
    ConnectionConfig, Connector, FunctionCode, PollingSession, SessionState, TcpConnector,
    log_sink,
};

/// Continuously reads coils or registers from a Modbus TCP device
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device host name or IP address
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Device port
    #[arg(short, long, default_value_t = 502, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Response timeout in seconds
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Seconds between two reads
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    cycle: u64,

    /// What to read: coils, discrete-inputs, holding-registers or input-registers
    #[arg(short, long, default_value = "holding-registers", value_parser = FunctionCode::from_str)]
    function: FunctionCode,

    /// Number of coils or registers read per cycle
    #[arg(short, long, default_value_t = 10)]
    quantity: u16,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    let config = ConnectionConfig::builder()
        .host(args.host)
        .port(args.port)
        .timeout(Duration::from_secs(args.timeout))
        .build()?;

    let mut session = PollingSession::new(config, TcpConnector, log_sink());
    session.start(
        Duration::from_secs(args.cycle),
        args.function,
        args.quantity,
    )?;
    println!("Continuous read started on {}", session.config());

    let stop_requested = match args.duration {
        Some(secs) => wait_until(&session, Some(Instant::now() + Duration::from_secs(secs)), None),
        None => {
            println!("Press Enter to stop");
            let rx = watch_for_enter(BufReader::new(std::io::stdin()));
            wait_until(&session, None, Some(rx))
        }
    };

    if !stop_requested {
        info!("worker stopped on its own");
    }
    session.stop();
    println!("Continuous read stopped");
    Ok(())
}

/// Signals once a line is read. A closed input (EOF or error) never signals.
fn watch_for_enter<R: BufRead + Send + 'static>(mut input: R) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut line = String::new();
        if let Ok(1..) = input.read_line(&mut line) {
            let _ = tx.send(());
        }
    });
    rx
}

/// Blocks until the deadline passes, a line arrives on stdin, or the worker exits.
/// Returns false when the worker exited first.
fn wait_until<C: Connector>(
    session: &PollingSession<C>,
    deadline: Option<Instant>,
    stdin: Option<mpsc::Receiver<()>>,
) -> bool {
    let tick = Duration::from_millis(200);
    loop {
        if session.state() == SessionState::Idle {
            return false;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return true;
        }
        match &stdin {
            Some(rx) => match rx.recv_timeout(tick) {
                Ok(()) => return true,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(tick),
            },
            None => thread::sleep(tick),
        }
    }
}
