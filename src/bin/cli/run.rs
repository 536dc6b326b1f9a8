use std::thread;
use std::time::{Duration, Instant};

use stomp_vu::config::parse_duration;
use stomp_vu::{
    AckMode, ClientConfig, Protocol, SendOptions, StompError, SubscribeOptions, VirtualContext,
};

use super::args::Cli;
use super::exit_codes;
use super::summary::Summary;

type CliError = (String, u8);

fn config_error(message: impl Into<String>) -> CliError {
    (message.into(), exit_codes::CONFIG_ERROR)
}

/// Build the connection configuration from the command line or `--config`.
pub fn build_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {}", path.display(), e)))?;
        let config = ClientConfig::from_json_str(&text).map_err(|e| config_error(e.to_string()))?;
        config.validate().map_err(|e| config_error(e.to_string()))?;
        return Ok(config);
    }

    let protocol: Protocol = cli
        .protocol
        .parse()
        .map_err(|e: StompError| config_error(e.to_string()))?;
    let mut config = ClientConfig::new(cli.address.clone())
        .protocol(protocol)
        .path(cli.path.clone())
        .verbose(cli.verbose);
    if let (Some(login), Some(passcode)) = (&cli.login, &cli.passcode) {
        config = config.login(login.clone(), passcode.clone());
    } else if let Some(login) = &cli.login {
        config.user = Some(login.clone());
    }
    if let Some(hb) = &cli.heartbeat {
        let (out, inc) = hb
            .split_once(',')
            .ok_or_else(|| config_error("heartbeat must be \"outgoing,incoming\""))?;
        let out = parse_duration(out).map_err(config_error)?;
        let inc = parse_duration(inc).map_err(config_error)?;
        config = config.heartbeat(out, inc);
    }
    config.validate().map_err(|e| config_error(e.to_string()))?;
    Ok(config)
}

struct Plan {
    config: ClientConfig,
    destination: String,
    ack: AckMode,
    receipt: bool,
    body: Vec<u8>,
    iterations: usize,
    read_timeout: Duration,
    pause: Duration,
}

/// Run every virtual user on its own thread against a shared runtime.
pub fn run(cli: &Cli) -> Result<Summary, CliError> {
    let config = build_config(cli)?;
    let ack: AckMode = cli
        .ack
        .parse()
        .map_err(|e: StompError| config_error(e.to_string()))?;
    let read_timeout = parse_duration(&cli.read_timeout).map_err(config_error)?;
    let pause = parse_duration(&cli.pause).map_err(config_error)?;
    if cli.vus == 0 {
        return Err(config_error("at least one virtual user is required"));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| (format!("cannot start runtime: {}", e), exit_codes::NETWORK_ERROR))?;

    println!(
        "Running {} virtual user(s) x {} iteration(s) against {} ({})",
        cli.vus,
        cli.iterations,
        config.addr,
        config.effective_protocol()
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(cli.vus);
    for vu in 1..=cli.vus {
        let plan = Plan {
            config: config.clone(),
            destination: cli.destination.replace("{vu}", &vu.to_string()),
            ack,
            receipt: cli.receipt,
            body: vec![b'x'; cli.size],
            iterations: cli.iterations,
            read_timeout,
            pause,
        };
        let handle = runtime.handle().clone();
        let spawned = thread::Builder::new()
            .name(format!("vu-{}", vu))
            .spawn(move || run_vu(vu, VirtualContext::new(handle), plan))
            .map_err(|e| (format!("cannot spawn vu thread: {}", e), exit_codes::NETWORK_ERROR))?;
        handles.push(spawned);
    }

    let mut summary = Summary::default();
    for handle in handles {
        match handle.join() {
            Ok(vu) => summary.merge(vu),
            Err(_) => {
                summary.vus += 1;
                summary.errors.entry("vu panicked").and_modify(|c| *c += 1).or_insert(1);
            }
        }
    }
    summary.elapsed = started.elapsed();
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(summary)
}

/// One virtual user: connect, subscribe, then send/read/ack per iteration.
fn run_vu(vu: usize, ctx: VirtualContext, plan: Plan) -> Summary {
    let mut summary = Summary {
        vus: 1,
        ..Summary::default()
    };

    let client = match ctx.connect(plan.config.clone()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(vu, error = %e, "connect failed");
            summary.record_connect_error(&e);
            return summary;
        }
    };
    summary.connected += 1;
    tracing::debug!(vu, server = ?client.server(), session = ?client.session(), "connected");

    let sub = match client.subscribe(
        &plan.destination,
        SubscribeOptions::from(plan.ack).receipt(true),
    ) {
        Ok(sub) => sub,
        Err(e) => {
            summary.record_error(&e);
            let _ = client.disconnect();
            return summary;
        }
    };

    let send_opts = SendOptions::new().receipt(plan.receipt);
    for iteration in 0..plan.iterations {
        summary.iterations += 1;
        let started = Instant::now();
        if let Err(e) = client.send_with(
            &plan.destination,
            "text/plain",
            plan.body.clone(),
            send_opts.clone().header("x-vu-iteration", iteration.to_string()),
        ) {
            summary.record_error(&e);
            if e.is_fatal() {
                break;
            }
            continue;
        }
        summary.sent += 1;

        match sub.read(Some(plan.read_timeout)) {
            Ok(msg) => {
                summary.received += 1;
                summary.round_trips.push(started.elapsed());
                if plan.ack != AckMode::Auto {
                    match client.ack(&msg) {
                        Ok(()) => summary.acked += 1,
                        Err(e) => summary.record_error(&e),
                    }
                }
            }
            Err(e) => {
                summary.record_error(&e);
                if e.is_fatal() || matches!(e, StompError::ConnectionClosed) {
                    break;
                }
            }
        }

        ctx.run_pending();
        if !plan.pause.is_zero() {
            ctx.sleep(plan.pause);
        }
    }

    if client.state() == stomp_vu::ConnectionState::Connected {
        if let Err(e) = sub.unsubscribe() {
            summary.record_error(&e);
        }
    }
    if let Err(e) = client.disconnect() {
        summary.record_error(&e);
    }
    summary
}
