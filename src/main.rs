use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use tokio::io::BufReader;

use mpv_control::command::{run_repl, CommandRegistry, Session};
use mpv_control::{Logger, MpvClient, PlayerConfig};

/// Drive an MPV player from the command line
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Config file (default: <config dir>/mpv-control/config.json)
  #[arg(short = 'c', long = "config", value_name = "FILE")]
  config: Option<PathBuf>,

  /// MPV executable (overrides the config file)
  #[arg(long = "mpv", value_name = "PATH")]
  mpv: Option<String>,

  /// Attach to an MPV already listening on this socket or pipe
  #[arg(short = 'a', long = "attach", value_name = "ADDRESS")]
  attach: Option<String>,

  /// Increase logging verbosity (default: config logLevel, -v: info, -vv: debug, -vvv+: trace)
  #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
  verbosity: u8,

  /// Extra arguments passed to MPV
  #[arg(last = true, value_name = "MPV_ARGS")]
  mpv_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();

  let mut config = PlayerConfig::load_or_default(args.config.as_deref())?;
  if args.mpv.is_some() {
    config.mpv_path = args.mpv.clone();
  }
  config.mpv_args.extend(args.mpv_args.iter().cloned());

  let default_level = match args.verbosity {
    0 => config.log_level.clone(),
    1 => "info".to_string(),
    2 => "debug".to_string(),
    _ => "trace".to_string(),
  };
  config.log_level = default_level.clone();

  // Console logging (respects RUST_LOG if set)
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&default_level))
    .format_timestamp_millis()
    .init();

  let log = Logger::new("mpv_control", config.log_level_filter()?);
  let client = match &args.attach {
    Some(address) => {
      info!("Attaching to MPV at {}", address);
      MpvClient::attach(address, config).await?
    }
    None => MpvClient::create_with_logger(config, log)?,
  };

  let registry = CommandRegistry::standard();
  let (session, notifications) = Session::new(client.clone());
  let input = BufReader::new(tokio::io::stdin());

  if let Err(e) = run_repl(&registry, &session, notifications, input, tokio::io::stdout()).await {
    error!("Console I/O failed: {}", e);
  }

  client.dispose();
  Ok(())
}
