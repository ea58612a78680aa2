use fxbridge_server::BridgeApp;
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host_pid = match (args.next().map(|a| a.parse::<u32>()), args.next()) {
        (Some(Ok(pid)), None) => pid,
        _ => {
            eprintln!("Usage: fxbridge-server <host-pid>");
            return ExitCode::from(2);
        }
    };

    let prefix =
        std::env::var(fxbridge::PREFIX_ENV).unwrap_or_else(|_| "fxbridge".to_string());

    match BridgeApp::run(&prefix, host_pid) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Bridge server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
