//! Command line configuration of the `diag` binary.

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::PathBuf,
};

use thiserror::Error;

use diag_common::FlowOptions;
use diag_transport::{DEFAULT_BAUD_RATE, DEFAULT_SOCKET_PORT};

/// Path of the local control socket.
pub const DEFAULT_CONTROL_PATH: &str = "/run/diag-router.sock";

/// Mount point of the USB FunctionFS instance.
pub const DEFAULT_USB_PATH: &str = "/dev/ffs-diag";

/// Printed on `-h` and after an unknown option.
pub const USAGE: &str = "\
User space application for diag interface

usage: diag [-h] [-s host[:port]] [-u dev[@baud]] [-t addr[:port]] [-a v6addr]
            [--peripheral PATH] [--control PATH] [--usb DIR]
            [--flow-high N] [--flow-low N]

options:
   -h                show this usage
   -s                <socket address[:port]>
   -u                <uart device name[@baudrate]>
   -t                <ipv4 bind address[:port]>
   -a                <ipv6 bind address>, as [addr]:port, [addr] or addr
   --peripheral      <modem diag channel>
   --control         <control socket path>
   --usb             <FunctionFS mount point>
   --flow-high       <buffers outstanding before a source is throttled>
   --flow-low        <buffers outstanding before a throttled source resumes>";

/// Reasons the command line is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{}", USAGE)]
    Usage,
    #[error("Invalid ipv6 address given {0}")]
    InvalidIpv6(String),
    #[error("invalid address given to {option}: {value}")]
    InvalidAddress { option: &'static str, value: String },
    #[error("invalid number given to {option}: {value}")]
    InvalidNumber { option: &'static str, value: String },
    #[error("option {0} requires an argument")]
    MissingValue(String),
    #[error("unknown option {0}")]
    UnknownOption(String),
    #[error("low-water mark {low} exceeds high-water mark {high}")]
    InvertedWaterMarks { high: usize, low: usize },
    #[error("low-water mark must be at least 1, a throttled source would never resume")]
    ZeroLowWater,
}

/// Everything the binary needs to bring the router up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Tool to connect to (`-s`).
    pub connect: Option<(String, u16)>,
    /// Serial device and baud rate (`-u`).
    pub uart: Option<(PathBuf, u32)>,
    /// IPv4 listener (`-t`).
    pub tcp4: Option<(Ipv4Addr, u16)>,
    /// IPv6 listener (`-a`).
    pub tcp6: Option<(Ipv6Addr, u16)>,
    /// Modem diag channel.
    pub peripheral: Option<PathBuf>,
    /// Control socket path (`--control`).
    pub control: PathBuf,
    /// FunctionFS mount point (`--usb`).
    pub usb: PathBuf,
    /// Backpressure water marks (`--flow-high`, `--flow-low`).
    pub flow: FlowOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect: None,
            uart: None,
            tcp4: None,
            tcp6: None,
            peripheral: None,
            control: PathBuf::from(DEFAULT_CONTROL_PATH),
            usb: PathBuf::from(DEFAULT_USB_PATH),
            flow: FlowOptions::default(),
        }
    }
}

impl Config {
    /// Parses the arguments following the program name. Short options take their value either
    /// attached (`-t127.0.0.1`) or as the next argument; long options take `--opt value` or
    /// `--opt=value`.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            let (option, inline) = split_option(&arg)?;
            let mut value = || match inline {
                Some(ref value) => Ok(value.clone()),
                None => args.next().ok_or_else(|| ConfigError::MissingValue(option.clone())),
            };

            match option.as_str() {
                "-h" | "--help" => return Err(ConfigError::Usage),
                "-s" => {
                    let value = value()?;
                    let (host, port) = split_port("-s", &value)?;
                    config.connect = Some((host.to_owned(), port));
                }
                "-u" => {
                    let value = value()?;
                    let (dev, baud) = match value.split_once('@') {
                        Some((dev, baud)) => (dev, parse_number("-u", baud)?),
                        None => (value.as_str(), DEFAULT_BAUD_RATE),
                    };
                    config.uart = Some((PathBuf::from(dev), baud));
                }
                "-t" => {
                    let value = value()?;
                    let (addr, port) = split_port("-t", &value)?;
                    let addr = addr.parse().map_err(|_| ConfigError::InvalidAddress {
                        option: "-t",
                        value: value.clone(),
                    })?;
                    config.tcp4 = Some((addr, port));
                }
                "-a" => config.tcp6 = Some(parse_ipv6_bind(&value()?)?),
                "--peripheral" => config.peripheral = Some(PathBuf::from(value()?)),
                "--control" => config.control = PathBuf::from(value()?),
                "--usb" => config.usb = PathBuf::from(value()?),
                "--flow-high" => {
                    let high = parse_number("--flow-high", &value()?)?;
                    config.flow = config.flow.high_water(high);
                }
                "--flow-low" => {
                    let low = parse_number("--flow-low", &value()?)?;
                    config.flow = config.flow.low_water(low);
                }
                _ => return Err(ConfigError::UnknownOption(arg)),
            }
        }

        if config.flow.low() == 0 {
            return Err(ConfigError::ZeroLowWater);
        }
        if config.flow.low() > config.flow.high() {
            return Err(ConfigError::InvertedWaterMarks {
                high: config.flow.high(),
                low: config.flow.low(),
            });
        }

        Ok(config)
    }
}

/// Splits an argument into the option name and an inline value, if any.
fn split_option(arg: &str) -> Result<(String, Option<String>), ConfigError> {
    if let Some(long) = arg.strip_prefix("--") {
        return Ok(match long.split_once('=') {
            Some((name, value)) => (format!("--{name}"), Some(value.to_owned())),
            None => (arg.to_owned(), None),
        });
    }

    let mut chars = arg.chars();
    match (chars.next(), chars.next()) {
        (Some('-'), Some(flag)) => {
            let rest = chars.as_str();
            let inline = (!rest.is_empty()).then(|| rest.to_owned());
            Ok((format!("-{flag}"), inline))
        }
        _ => Err(ConfigError::UnknownOption(arg.to_owned())),
    }
}

fn parse_number<T: std::str::FromStr>(option: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidNumber { option, value: value.to_owned() })
}

/// Splits `host[:port]`, defaulting the port.
fn split_port<'a>(option: &'static str, value: &'a str) -> Result<(&'a str, u16), ConfigError> {
    match value.split_once(':') {
        Some((host, port)) => Ok((host, parse_number(option, port)?)),
        None => Ok((value, DEFAULT_SOCKET_PORT)),
    }
}

/// Parses the IPv6 bind address forms `[addr]:port`, `[addr]` and `addr`.
pub fn parse_ipv6_bind(arg: &str) -> Result<(Ipv6Addr, u16), ConfigError> {
    let invalid = || ConfigError::InvalidIpv6(arg.to_owned());

    let (addr, port) = match (arg.find('['), arg.find(']')) {
        (None, None) => (arg, None),
        (Some(0), Some(close)) => {
            let rest = &arg[close + 1..];
            let port = if rest.is_empty() {
                None
            } else {
                // The port must follow the closing bracket directly.
                let port = rest.strip_prefix(':').ok_or_else(invalid)?;
                Some(port.parse::<u16>().map_err(|_| invalid())?)
            };
            (&arg[1..close], port)
        }
        // One bracket missing, `]` before `[`, or `[` not leading.
        _ => return Err(invalid()),
    };

    let addr = addr.parse::<Ipv6Addr>().map_err(|_| invalid())?;
    Ok((addr, port.unwrap_or(DEFAULT_SOCKET_PORT)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        Config::from_args(args.iter().copied())
    }

    #[test]
    fn bracketed_ipv6_with_port() {
        assert_eq!(parse_ipv6_bind("[::1]:9001").unwrap(), (Ipv6Addr::LOCALHOST, 9001));
    }

    #[test]
    fn ipv6_without_port_uses_default() {
        assert_eq!(parse_ipv6_bind("[::1]").unwrap(), (Ipv6Addr::LOCALHOST, 2500));
        assert_eq!(parse_ipv6_bind("::1").unwrap(), (Ipv6Addr::LOCALHOST, 2500));
    }

    #[test]
    fn malformed_brackets_are_rejected() {
        for arg in ["[::1", "::1]", "]::1[", "x[::1]", "[::1]9001", "[::1]:", "[::1]:port", "[::1]:70000"] {
            assert_eq!(
                parse_ipv6_bind(arg),
                Err(ConfigError::InvalidIpv6(arg.to_owned())),
                "{arg} should be rejected"
            );
        }

        let err = parse(&["-a", "[::1"]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid ipv6 address given [::1");
    }

    #[test]
    fn transports_and_defaults() {
        let config = parse(&["-s", "10.0.0.2", "-t127.0.0.1:9000", "-u", "/dev/ttyUSB0@921600"]).unwrap();
        assert_eq!(config.connect, Some(("10.0.0.2".to_owned(), 2500)));
        assert_eq!(config.tcp4, Some((Ipv4Addr::LOCALHOST, 9000)));
        assert_eq!(config.uart, Some((PathBuf::from("/dev/ttyUSB0"), 921600)));
        assert_eq!(config.control, PathBuf::from(DEFAULT_CONTROL_PATH));
        assert_eq!(config.usb, PathBuf::from(DEFAULT_USB_PATH));

        let config = parse(&["-u", "/dev/ttyMSM0"]).unwrap();
        assert_eq!(config.uart, Some((PathBuf::from("/dev/ttyMSM0"), 115200)));
    }

    #[test]
    fn long_options() {
        let config =
            parse(&["--peripheral=/dev/diag", "--flow-high", "8", "--flow-low=2", "--control", "/tmp/d.sock"])
                .unwrap();
        assert_eq!(config.peripheral, Some(PathBuf::from("/dev/diag")));
        assert_eq!(config.flow, FlowOptions::default().high_water(8).low_water(2));
        assert_eq!(config.control, PathBuf::from("/tmp/d.sock"));

        assert_eq!(
            parse(&["--flow-high", "1", "--flow-low", "4"]),
            Err(ConfigError::InvertedWaterMarks { high: 1, low: 4 })
        );
        assert_eq!(parse(&["--flow-low", "0"]), Err(ConfigError::ZeroLowWater));
        assert_eq!(parse(&["--flow-high", "1", "--flow-low", "1"]).unwrap().flow.low(), 1);
    }

    #[test]
    fn bad_arguments() {
        assert_eq!(parse(&["-h"]), Err(ConfigError::Usage));
        assert_eq!(parse(&["-t"]), Err(ConfigError::MissingValue("-t".to_owned())));
        assert!(matches!(parse(&["-x"]), Err(ConfigError::UnknownOption(_))));
        assert!(matches!(parse(&["stray"]), Err(ConfigError::UnknownOption(_))));
        assert!(matches!(parse(&["-t", "localhost"]), Err(ConfigError::InvalidAddress { .. })));
        assert!(matches!(parse(&["-s", "host:abc"]), Err(ConfigError::InvalidNumber { .. })));
    }
}
