// main.rs - snapzones daemon and one-shot client
//
//   snapzones                 run the daemon
//   snapzones msg '<json>'    send one IPC command, print the reply

use snapzones::config::Settings;
use snapzones::ipc::{self, IpcCommand};
use snapzones::service;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("msg") => {
            let raw = args.get(1).ok_or("usage: snapzones msg '<json command>'")?;
            let cmd: IpcCommand = serde_json::from_str(raw)?;
            let reply = ipc::send_command(&cmd)?;
            print!("{reply}");
            Ok(())
        }
        Some(other) => Err(format!("unknown argument '{other}'").into()),
        None => service::run(Settings::load()),
    }
}
