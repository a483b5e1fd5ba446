#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::process;
use warmsh::daemon::protocol::{SessionRequest, EXIT_CONNECTION_LOST};
use warmsh::daemon::{DaemonConfig, SessionClient};
use warmsh::error::SessionError;
use warmsh::{logging, terminal};

fn main() {
    logging::init_client();

    // Every argument belongs to the shell; the client takes no options.
    match connect_and_attach() {
        Ok(proxy) => proxy.run(),
        Err(e) => {
            eprintln!("warmsh: {:#}", e);
            let code = e
                .downcast_ref::<SessionError>()
                .map_or(EXIT_CONNECTION_LOST, SessionError::exit_code);
            process::exit(code);
        }
    }
}

fn connect_and_attach() -> anyhow::Result<warmsh::daemon::TerminalProxy> {
    let config = DaemonConfig::load()?;
    let request = SessionRequest::from_current_process(terminal::is_interactive())?;
    let client = SessionClient::connect(&config.socket_path)?;
    client.attach(&request)
}
