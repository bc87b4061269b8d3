use std::process::ExitCode;

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use diag::{
    config::{Config, ConfigError, USAGE},
    connect, peripheral, serial, usb, Listener, Reactor, ReactorError, Router, RouterError,
    RouterOptions, Token, TransportError,
};

#[derive(Debug, Error)]
enum Error {
    #[error("failed to connect to client: {0}")]
    Connect(TransportError),
    #[error("failed to open uart: {0}")]
    Uart(TransportError),
    #[error("failed to open tcp4 bind: {0}")]
    Tcp4(TransportError),
    #[error("failed to open tcp6 bind: {0}")]
    Tcp6(TransportError),
    #[error("failed to create control socket: {0}")]
    Control(TransportError),
    #[error("failed to open peripheral: {0}")]
    Peripheral(TransportError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e @ ConfigError::UnknownOption(_)) => {
            eprintln!("{e}\n\n{USAGE}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Opens every configured transport, attaches the peripheral and runs the router.
fn run(config: Config) -> Result<(), Error> {
    let mut reactor = Reactor::new()?;
    let mut router = Router::new(RouterOptions::default().flow(config.flow));

    if let Some((ref host, port)) = config.connect {
        if config.uart.is_some() {
            warn!("both -s and -u given, ignoring -u");
        }

        let fd = connect::tcp(host, port).map_err(Error::Connect)?;
        add_framed_client(&mut router, &mut reactor, format!("socket {host}:{port}"), fd)?;
    } else if let Some((ref dev, baud)) = config.uart {
        let fd = serial::open(dev, baud).map_err(Error::Uart)?;
        add_framed_client(&mut router, &mut reactor, format!("uart {}", dev.display()), fd)?;
    }

    if let Some((addr, port)) = config.tcp4 {
        let listener = Listener::tcp4(addr, port).map_err(Error::Tcp4)?;
        router.add_listener(&mut reactor, listener)?;
    }

    if let Some((addr, port)) = config.tcp6 {
        let listener = Listener::tcp6(addr, port).map_err(Error::Tcp6)?;
        router.add_listener(&mut reactor, listener)?;
    }

    match usb::open(&config.usb).and_then(usb::bridge) {
        Ok(fd) => {
            let id = router.add_client("usb", fd, None, true);
            if let Err(e) = router.enable_client(&mut reactor, id) {
                warn!(err = %e, "usb: cannot watch endpoints, continuing without it");
                router.remove_client(&mut reactor, id);
            }
        }
        Err(e) => warn!(err = %e, "usb: not available, continuing without it"),
    }

    let control = Listener::control(&config.control).map_err(Error::Control)?;
    router.add_listener(&mut reactor, control)?;

    match config.peripheral {
        Some(ref path) => {
            let fd = peripheral::open(path).map_err(Error::Peripheral)?;
            router.set_peripheral(&mut reactor, fd)?;
        }
        None => warn!("no peripheral configured, only local commands are served"),
    }

    info!(commands = router.commands().len(), watches = reactor.len(), "router running");
    reactor.run(&mut router)?;

    Ok(())
}

fn add_framed_client(
    router: &mut Router,
    reactor: &mut Reactor<Token>,
    label: String,
    fd: std::os::fd::OwnedFd,
) -> Result<(), Error> {
    let id = router.add_client(label, fd, None, true);
    router.enable_client(reactor, id)?;
    Ok(())
}
