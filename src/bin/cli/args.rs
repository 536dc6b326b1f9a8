use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stomp-vu")]
#[command(version)]
#[command(about = "Drive virtual STOMP users against a broker and summarise the outcome")]
pub struct Cli {
    /// STOMP broker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    pub address: String,

    /// Transport: tcp, tls, ws or wss
    #[arg(long, default_value = "tcp")]
    pub protocol: String,

    /// WebSocket endpoint path
    #[arg(long, default_value = "/ws")]
    pub path: String,

    /// Login username
    #[arg(short, long)]
    pub login: Option<String>,

    /// Passcode
    #[arg(short, long)]
    pub passcode: Option<String>,

    /// Heartbeat proposal as "outgoing,incoming" durations, e.g. "10s,10s"
    #[arg(long)]
    pub heartbeat: Option<String>,

    /// JSON configuration document; command line flags are ignored when set
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of virtual users, each on its own connection
    #[arg(short = 'u', long, default_value_t = 1)]
    pub vus: usize,

    /// Iterations per virtual user
    #[arg(short, long, default_value_t = 10)]
    pub iterations: usize,

    /// Destination; `{vu}` is replaced by the virtual user number
    #[arg(short, long, default_value = "/queue/stomp-vu.{vu}")]
    pub destination: String,

    /// Ack mode: auto, client or client-individual
    #[arg(long, default_value = "client")]
    pub ack: String,

    /// Request a receipt for every SEND
    #[arg(long)]
    pub receipt: bool,

    /// Message body size in bytes
    #[arg(long, default_value_t = 64)]
    pub size: usize,

    /// How long a read waits for its message, e.g. "5s"
    #[arg(long, default_value = "5s")]
    pub read_timeout: String,

    /// Pause between iterations, e.g. "100ms"
    #[arg(long, default_value = "0s")]
    pub pause: String,

    /// Log every frame on the wire
    #[arg(short, long)]
    pub verbose: bool,
}
